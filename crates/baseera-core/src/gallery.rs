//! Enrolled-employee gallery and the identity matcher built on it.

use crate::recognizer::{Embedder, RecognizerError};
use crate::types::{CosineMatcher, FaceModel, MatchCandidate, Matcher};
use image::GrayImage;
use std::sync::{Arc, RwLock};

/// Shared, cloneable handle to the enrolled face models.
///
/// The recognition worker reads it on every match; enrollment and employee
/// removal update it in place.
#[derive(Clone, Default)]
pub struct Gallery {
    models: Arc<RwLock<Vec<FaceModel>>>,
}

impl Gallery {
    pub fn new(models: Vec<FaceModel>) -> Self {
        Self {
            models: Arc::new(RwLock::new(models)),
        }
    }

    pub fn len(&self) -> usize {
        self.models.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn replace(&self, models: Vec<FaceModel>) -> Result<(), RecognizerError> {
        *self.models.write().map_err(|_| RecognizerError::GalleryPoisoned)? = models;
        Ok(())
    }

    pub fn extend(&self, models: impl IntoIterator<Item = FaceModel>) -> Result<(), RecognizerError> {
        self.models
            .write()
            .map_err(|_| RecognizerError::GalleryPoisoned)?
            .extend(models);
        Ok(())
    }

    /// Drop every model of `employee`. Returns how many were removed.
    pub fn remove_employee(&self, employee: &str) -> Result<usize, RecognizerError> {
        let mut models = self.models.write().map_err(|_| RecognizerError::GalleryPoisoned)?;
        let before = models.len();
        models.retain(|m| m.employee != employee);
        Ok(before - models.len())
    }

    /// Run `f` against the current models under a read lock.
    pub fn with_models<R>(&self, f: impl FnOnce(&[FaceModel]) -> R) -> Result<R, RecognizerError> {
        let models = self.models.read().map_err(|_| RecognizerError::GalleryPoisoned)?;
        Ok(f(&models))
    }
}

/// Finds the closest enrolled identity for a face crop.
pub trait IdentityMatcher {
    fn identify(&mut self, crop: &GrayImage) -> Result<Option<MatchCandidate>, RecognizerError>;
}

/// Embeds the crop, then scans the gallery by cosine distance.
pub struct GalleryMatcher<E> {
    embedder: E,
    gallery: Gallery,
}

impl<E: Embedder> GalleryMatcher<E> {
    pub fn new(embedder: E, gallery: Gallery) -> Self {
        Self { embedder, gallery }
    }

    pub fn embedder_mut(&mut self) -> &mut E {
        &mut self.embedder
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }
}

impl<E: Embedder> IdentityMatcher for GalleryMatcher<E> {
    fn identify(&mut self, crop: &GrayImage) -> Result<Option<MatchCandidate>, RecognizerError> {
        if self.gallery.is_empty() {
            return Ok(None);
        }
        let probe = self.embedder.embed(crop)?;
        self.gallery.with_models(|models| CosineMatcher.closest(&probe, models))
    }
}
