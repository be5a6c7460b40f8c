mod image_caption;

pub use image_caption::*;

/// A loaded model that turns items into outputs.
///
/// `process` takes `&mut self` because inference mutates internal state
/// (kv caches, sampler state). Callers share a model through
/// [`crate::ModelHandle`], which serializes access.
pub trait Model {
    type Item;
    type Output;

    fn process(
        &mut self,
        items: Vec<Self::Item>,
    ) -> anyhow::Result<Vec<anyhow::Result<Self::Output>>>;

    fn batch_size_limit(&self) -> usize;

    fn process_single(&mut self, item: Self::Item) -> anyhow::Result<Self::Output> {
        self.process(vec![item])?
            .into_iter()
            .next()
            .ok_or(anyhow::anyhow!("no result"))?
    }
}
