//! Process-lifetime model session.
//!
//! A [`Session`] owns the base model (loaded at most once) and remembers which
//! adapter is attached to it. All access goes through [`Session::lock`], so
//! jobs sharing a session run one after another: an adapter swap can never
//! bleed into another job's generation.

use std::sync::{Arc, Mutex as StdMutex};

use anyhow::anyhow;
use secrecy::SecretString;
use tokio::sync::{Mutex, MutexGuard};

use crate::{AdapterFetcher, AdapterId, JobError, Loader, ModelLike};

struct SessionState<M> {
    /// Shared with the blocking task that is using it, so a dropped job
    /// cannot take the model down with it.
    model: Option<Arc<StdMutex<M>>>,
    /// Set once the first load starts; a second load is never attempted.
    initialized: bool,
    /// `None` while nothing is attached or while an attach did not finish.
    adapter: Option<AdapterId>,
}

pub struct Session<L: Loader> {
    loader: L,
    fetcher: Arc<dyn AdapterFetcher>,
    default_adapter: Option<AdapterId>,
    state: Mutex<SessionState<L::Model>>,
}

impl<L: Loader> Session<L> {
    pub fn new(loader: L, fetcher: Arc<dyn AdapterFetcher>) -> Self {
        Self {
            loader,
            fetcher,
            default_adapter: None,
            state: Mutex::new(SessionState {
                model: None,
                initialized: false,
                adapter: None,
            }),
        }
    }

    /// Adapter attached right after the base model loads.
    pub fn with_default_adapter(mut self, adapter: AdapterId) -> Self {
        self.default_adapter = Some(adapter);
        self
    }

    /// Waits for exclusive use of the session.
    pub async fn lock(&self) -> SessionGuard<'_, L> {
        SessionGuard {
            session: self,
            state: self.state.lock().await,
        }
    }

    pub async fn bound_adapter(&self) -> Option<AdapterId> {
        self.state.lock().await.adapter.clone()
    }

    pub async fn is_loaded(&self) -> bool {
        self.state.lock().await.model.is_some()
    }
}

/// Exclusive handle on a [`Session`], held for the duration of one job.
pub struct SessionGuard<'a, L: Loader> {
    session: &'a Session<L>,
    state: MutexGuard<'a, SessionState<L::Model>>,
}

impl<L: Loader> SessionGuard<'_, L> {
    /// Loads the base model on first use; a no-op afterwards.
    pub async fn ensure_base_loaded(&mut self) -> Result<(), JobError> {
        if self.state.model.is_some() {
            return Ok(());
        }
        if self.state.initialized {
            return Err(JobError::Initialization(anyhow!(
                "base model is unavailable after an earlier failure"
            )));
        }
        self.state.initialized = true;

        tracing::info!("loading base model");
        let model = self
            .session
            .loader
            .load()
            .await
            .map_err(JobError::Initialization)?;
        self.state.model = Some(Arc::new(StdMutex::new(model)));
        tracing::info!("base model loaded");

        if let Some(adapter) = self.session.default_adapter.clone() {
            self.swap_adapter(&adapter, None)
                .await
                .map_err(|e| JobError::Initialization(anyhow!(e)))?;
        }
        Ok(())
    }

    /// Attaches `adapter` unless it is already the bound one.
    ///
    /// On failure the previous binding stays in place.
    pub async fn ensure_adapter_loaded(
        &mut self,
        adapter: &AdapterId,
        token: Option<&SecretString>,
    ) -> Result<(), JobError> {
        self.ensure_base_loaded().await?;
        self.swap_adapter(adapter, token).await
    }

    async fn swap_adapter(
        &mut self,
        adapter: &AdapterId,
        token: Option<&SecretString>,
    ) -> Result<(), JobError> {
        if self.state.adapter.as_ref() == Some(adapter) {
            tracing::debug!(%adapter, "adapter already bound");
            return Ok(());
        }

        let adapter_error = |source| JobError::AdapterLoad {
            repo: adapter.repo.clone(),
            source,
        };

        let weights = self
            .session
            .fetcher
            .fetch(adapter, token)
            .await
            .map_err(adapter_error)?;

        tracing::info!(%adapter, previous = ?self.state.adapter, "attaching adapter");
        // Cleared until the attach reports back: if this job is dropped midway,
        // the next job asking for any adapter attaches it again.
        let previous = self.state.adapter.take();
        match self
            .with_model(move |model| model.attach_adapter(&weights))
            .await
        {
            Ok(()) => {
                self.state.adapter = Some(adapter.clone());
                Ok(())
            }
            Err(e) => {
                self.state.adapter = previous;
                Err(adapter_error(e))
            }
        }
    }

    pub fn bound_adapter(&self) -> Option<&AdapterId> {
        self.state.adapter.as_ref()
    }

    /// Runs `f` against the base model on the blocking pool.
    ///
    /// The blocking task holds its own handle on the model, so dropping the
    /// returned future lets the work finish and leaves the model in place.
    pub async fn with_model<T, F>(&mut self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut L::Model) -> anyhow::Result<T> + Send + 'static,
    {
        let model = self
            .state
            .model
            .clone()
            .ok_or_else(|| anyhow!("base model is not loaded"))?;

        tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| anyhow!("base model is unusable after a panic in an earlier job"))?;
            f(&mut *model)
        })
        .await
        .map_err(|e| anyhow!("model task failed: {e}"))?
    }
}


#[cfg(test)]
mod tests {
    use std::{path::PathBuf, sync::atomic::Ordering, time::Duration};

    use super::testing::*;
    use super::*;
    use crate::GenerationRequest;

    fn session(loader: FakeLoader) -> (Session<FakeLoader>, Arc<FakeFetcher>) {
        let fetcher = Arc::new(FakeFetcher::default());
        (Session::new(loader, fetcher.clone()), fetcher)
    }

    #[tokio::test]
    async fn base_model_loads_once() {
        let loader = FakeLoader::default();
        let probe = loader.probe.clone();
        let (session, _) = session(loader);

        for _ in 0..3 {
            session.lock().await.ensure_base_loaded().await.unwrap();
        }

        assert_eq!(probe.loads.load(Ordering::SeqCst), 1);
        assert!(session.is_loaded().await);
    }

    #[tokio::test]
    async fn failed_load_is_not_retried() {
        let loader = FakeLoader {
            fail_load: true,
            ..Default::default()
        };
        let probe = loader.probe.clone();
        let (session, _) = session(loader);

        let first = session.lock().await.ensure_base_loaded().await.unwrap_err();
        let second = session.lock().await.ensure_base_loaded().await.unwrap_err();

        assert!(first.is_fatal());
        assert!(second.is_fatal());
        assert_eq!(probe.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn adapter_swap_is_last_writer_wins() {
        let loader = FakeLoader::default();
        let probe = loader.probe.clone();
        let (session, _) = session(loader);

        let x = AdapterId::new("acme/x", "lora.safetensors");
        let y = AdapterId::new("acme/y", "lora.safetensors");
        session.lock().await.ensure_adapter_loaded(&x, None).await.unwrap();
        session.lock().await.ensure_adapter_loaded(&y, None).await.unwrap();

        assert_eq!(session.bound_adapter().await, Some(y));
        assert_eq!(
            *probe.attached.lock().unwrap(),
            vec![
                PathBuf::from("/cache/acme/x/lora.safetensors"),
                PathBuf::from("/cache/acme/y/lora.safetensors"),
            ]
        );
    }

    #[tokio::test]
    async fn same_adapter_is_not_refetched() {
        let (session, fetcher) = session(FakeLoader::default());
        let x = AdapterId::new("acme/x", "lora.safetensors");

        session.lock().await.ensure_adapter_loaded(&x, None).await.unwrap();
        session.lock().await.ensure_adapter_loaded(&x, None).await.unwrap();

        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_weight_file_counts_as_a_new_adapter() {
        let (session, fetcher) = session(FakeLoader::default());

        let mut guard = session.lock().await;
        guard
            .ensure_adapter_loaded(&AdapterId::new("acme/x", "a.safetensors"), None)
            .await
            .unwrap();
        guard
            .ensure_adapter_loaded(&AdapterId::new("acme/x", "b.safetensors"), None)
            .await
            .unwrap();

        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(
            guard.bound_adapter(),
            Some(&AdapterId::new("acme/x", "b.safetensors"))
        );
    }

    #[tokio::test]
    async fn failed_fetch_keeps_previous_binding() {
        let (session, _) = session(FakeLoader::default());
        let x = AdapterId::new("acme/x", "lora.safetensors");
        session.lock().await.ensure_adapter_loaded(&x, None).await.unwrap();

        let err = session
            .lock()
            .await
            .ensure_adapter_loaded(&AdapterId::new("missing/repo", "lora.safetensors"), None)
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::AdapterLoad { ref repo, .. } if repo == "missing/repo"));
        assert!(!err.is_fatal());
        assert_eq!(session.bound_adapter().await, Some(x));
    }

    #[tokio::test]
    async fn failed_attach_keeps_previous_binding() {
        let (session, _) = session(FakeLoader::default());
        let x = AdapterId::new("acme/x", "lora.safetensors");
        session.lock().await.ensure_adapter_loaded(&x, None).await.unwrap();

        let broken = AdapterId::new("acme/odd", "broken.safetensors");
        let err = session
            .lock()
            .await
            .ensure_adapter_loaded(&broken, None)
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::AdapterLoad { .. }));
        assert_eq!(session.bound_adapter().await, Some(x));
        assert!(session.is_loaded().await);
    }

    #[tokio::test]
    async fn default_adapter_is_bound_at_load() {
        let fetcher = Arc::new(FakeFetcher::default());
        let default = AdapterId::new("acme/style", "style.safetensors");
        let session = Session::new(FakeLoader::default(), fetcher)
            .with_default_adapter(default.clone());

        session.lock().await.ensure_base_loaded().await.unwrap();

        assert_eq!(session.bound_adapter().await, Some(default));
    }

    #[tokio::test]
    async fn token_reaches_the_fetcher() {
        let (session, fetcher) = session(FakeLoader::default());
        let token = SecretString::from("hf_token");

        session
            .lock()
            .await
            .ensure_adapter_loaded(&AdapterId::new("acme/x", "lora.safetensors"), Some(&token))
            .await
            .unwrap();

        assert_eq!(fetcher.tokens_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_generation_keeps_the_model() {
        let loader = FakeLoader {
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        };
        let probe = loader.probe.clone();
        let (session, _) = session(loader);
        session.lock().await.ensure_base_loaded().await.unwrap();

        let request = GenerationRequest {
            prompt: "slow".to_string(),
            negative_prompt: None,
            width: 256,
            height: 256,
            steps: 1,
            guidance: 3.5,
            num_images: 1,
            seed: 1,
        };
        let dropped = {
            let request = request.clone();
            tokio::time::timeout(Duration::from_millis(20), async {
                let mut guard = session.lock().await;
                guard.with_model(move |model| model.run(&request)).await
            })
            .await
        };
        assert!(dropped.is_err());

        let images = session
            .lock()
            .await
            .with_model(move |model| model.run(&request))
            .await
            .unwrap();

        assert_eq!(images.len(), 1);
        assert!(session.is_loaded().await);
        assert_eq!(probe.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dropped_attach_forgets_the_binding() {
        let loader = FakeLoader {
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        };
        let probe = loader.probe.clone();
        let (session, fetcher) = session(loader);
        let x = AdapterId::new("acme/x", "lora.safetensors");
        session.lock().await.ensure_base_loaded().await.unwrap();

        let dropped = tokio::time::timeout(Duration::from_millis(20), async {
            session.lock().await.ensure_adapter_loaded(&x, None).await
        })
        .await;
        assert!(dropped.is_err());
        assert_eq!(session.bound_adapter().await, None);

        // The half-finished attach is not trusted, so asking again re-attaches.
        session.lock().await.ensure_adapter_loaded(&x, None).await.unwrap();

        assert_eq!(session.bound_adapter().await, Some(x));
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(probe.attached.lock().unwrap().len(), 2);
    }
}
