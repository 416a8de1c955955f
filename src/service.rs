use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures::{future::BoxFuture, FutureExt};
use tokio::sync::OnceCell;
use tracing::info;

use crate::model::SegmentModel;

type Loader<M> = Box<dyn Fn() -> BoxFuture<'static, Result<M>> + Send + Sync>;

/// The process-wide model, created on first use.
///
/// Concurrent first callers wait on the same initialization; a failed load
/// leaves the cell empty so the next request retries.
pub struct LazyModel<M> {
    cell: OnceCell<Arc<M>>,
    loader: Loader<M>,
}

impl<M: SegmentModel> LazyModel<M> {
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<M>> + Send + Sync + 'static,
    {
        Self {
            cell: OnceCell::new(),
            loader: Box::new(loader),
        }
    }

    /// Wraps an already loaded model.
    pub fn ready(model: M) -> Self {
        Self {
            cell: OnceCell::new_with(Some(Arc::new(model))),
            loader: Box::new(|| async { Err::<M, _>(anyhow!("model is already loaded")) }.boxed()),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }

    pub async fn get(&self) -> Result<Arc<M>> {
        self.cell
            .get_or_try_init(|| async {
                info!("Initializing SAM model...");
                let model = (self.loader)().await?;
                info!("SAM model ready!");
                Ok(Arc::new(model))
            })
            .await
            .map(Arc::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Prompt, ScoredMask};
    use futures::future::join_all;
    use image::RgbImage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Nothing;

    impl SegmentModel for Nothing {
        type Embedding = ();

        fn embed(&self, _image: &RgbImage) -> Result<()> {
            Ok(())
        }

        fn decode(&self, _: &(), _: &Prompt, _: bool) -> Result<Vec<ScoredMask>> {
            Ok(Vec::new())
        }

        fn generate(&self, _: &()) -> Result<Vec<ScoredMask>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn concurrent_first_use_loads_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let lazy = LazyModel::new(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                Ok::<_, anyhow::Error>(Nothing)
            }
            .boxed()
        });

        assert!(!lazy.is_loaded());
        let results = join_all((0..8).map(|_| lazy.get())).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(lazy.is_loaded());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_load_is_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let lazy = LazyModel::new(move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    return Err(anyhow!("download interrupted"));
                }
                Ok(Nothing)
            }
            .boxed()
        });

        assert!(lazy.get().await.is_err());
        assert!(!lazy.is_loaded());
        assert!(lazy.get().await.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn ready_model_counts_as_loaded() {
        assert!(LazyModel::ready(Nothing).is_loaded());
    }
}
