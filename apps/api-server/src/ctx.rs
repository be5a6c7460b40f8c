use ai::{CaptionService, ImageCaptionModel};

/// Application state handed to every route.
pub struct Ctx<M> {
    caption_service: CaptionService<M>,
}

impl<M> Clone for Ctx<M> {
    fn clone(&self) -> Self {
        Self {
            caption_service: self.caption_service.clone(),
        }
    }
}

impl<M> Ctx<M>
where
    M: ImageCaptionModel + Send + 'static,
{
    pub fn new(caption_service: CaptionService<M>) -> Self {
        Self { caption_service }
    }

    pub fn caption_service(&self) -> &CaptionService<M> {
        &self.caption_service
    }
}
