//! Single-flight short-lived credential cache (§4.7).
//!
//! Each pushkin that needs a refreshable credential (APNs provider JWT, FCM
//! OAuth2 access token) owns one of these keyed by its own identity. The
//! critical section never holds across an `.await`, so a plain
//! `std::sync::Mutex` guards the state; waiters park on a `tokio::sync::Notify`
//! rather than a second async mutex, mirroring the teacher's
//! `ServiceAuthClient` (sign-on-demand) pattern but adding the coalescing the
//! teacher didn't need for a single DS-to-DS signer.

use std::future::Future;
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::Notify;

/// The error surfaced to every waiter on a failed or cancelled refresh.
#[derive(Debug, Clone, thiserror::Error)]
#[error("credential refresh failed: {0}")]
pub struct AuthCacheError(pub String);

struct Entry<T> {
    value: T,
    expires_at: Instant,
}

struct State<T> {
    entry: Option<Entry<T>>,
    refresh_in_progress: bool,
    generation: u64,
    last_result: Option<(u64, Result<T, AuthCacheError>)>,
}

pub struct AuthTokenCache<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    refresh_margin: std::time::Duration,
    /// Pushkin identity this cache belongs to, for the token-refresh metric.
    label: String,
}

impl<T: Clone> AuthTokenCache<T> {
    /// `refresh_margin` is how far ahead of the reported expiry a refresh is
    /// triggered -- APNs regenerates at 55 minutes of a 60 minute budget,
    /// FCM at 60 seconds of its `expires_in`. `label` is the owning
    /// pushkin's identity, attached to the `pushkin_token_refresh_total`
    /// metric (§6: "token refresh attempts/failures").
    pub fn new(refresh_margin: std::time::Duration, label: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(State {
                entry: None,
                refresh_in_progress: false,
                generation: 0,
                last_result: None,
            }),
            notify: Notify::new(),
            refresh_margin,
            label: label.into(),
        }
    }

    /// Drop any cached value, forcing the next caller to refresh. Used after
    /// a provider reports the credential itself was rejected (APNs 403
    /// `ExpiredProviderToken`, FCM 401) so the retry-once path gets a fresh
    /// token rather than the one that just failed.
    pub fn invalidate(&self) {
        let mut guard = self.state.lock().expect("auth cache mutex poisoned");
        guard.entry = None;
    }

    /// Return a live value, refreshing it (single-flight across concurrent
    /// callers) if absent or within the refresh margin of expiry.
    pub async fn get_or_refresh<F, Fut, E>(&self, refresh: F) -> Result<T, AuthCacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(T, Instant), E>>,
        E: std::fmt::Display,
    {
        let mut waited_generation: Option<u64> = None;

        loop {
            let mut guard = self.state.lock().expect("auth cache mutex poisoned");

            if let Some(entry) = &guard.entry {
                if entry.expires_at > Instant::now() + self.refresh_margin {
                    return Ok(entry.value.clone());
                }
            }

            if let Some(waited) = waited_generation {
                if let Some((gen, result)) = &guard.last_result {
                    if *gen == waited {
                        return result.clone();
                    }
                }
            }

            if !guard.refresh_in_progress {
                guard.refresh_in_progress = true;
                guard.generation += 1;
                let generation = guard.generation;
                drop(guard);
                return self.run_refresh(generation, refresh).await;
            }

            let generation = guard.generation;
            // Must construct the `Notified` future before releasing the
            // lock: otherwise a `notify_waiters()` between the unlock and
            // the `.notified()` call here is missed and this waiter parks
            // forever.
            let notified = self.notify.notified();
            drop(guard);
            notified.await;
            waited_generation = Some(generation);
        }
    }

    async fn run_refresh<F, Fut, E>(&self, generation: u64, refresh: F) -> Result<T, AuthCacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(T, Instant), E>>,
        E: std::fmt::Display,
    {
        let mut guard = RefreshGuard {
            cache: self,
            generation,
            done: false,
        };

        let result = match refresh().await {
            Ok((value, expires_at)) => {
                let mut state = self.state.lock().expect("auth cache mutex poisoned");
                state.entry = Some(Entry {
                    value: value.clone(),
                    expires_at,
                });
                state.refresh_in_progress = false;
                state.last_result = Some((generation, Ok(value.clone())));
                crate::metrics::record_token_refresh(&self.label, "ok");
                Ok(value)
            }
            Err(e) => {
                let err = AuthCacheError(e.to_string());
                let mut state = self.state.lock().expect("auth cache mutex poisoned");
                state.refresh_in_progress = false;
                state.last_result = Some((generation, Err(err.clone())));
                crate::metrics::record_token_refresh(&self.label, "error");
                Err(err)
            }
        };

        guard.done = true;
        drop(guard);
        self.notify.notify_waiters();
        result
    }
}

/// Clears `refresh_in_progress` and wakes waiters even if `run_refresh` is
/// aborted mid-`.await` -- otherwise a cancelled refresher would leave every
/// future caller parked forever (spec §5: "not leave the Auth Token Cache
/// with a stale `refresh_in_progress` flag").
struct RefreshGuard<'a, T> {
    cache: &'a AuthTokenCache<T>,
    generation: u64,
    done: bool,
}

impl<'a, T: Clone> Drop for RefreshGuard<'a, T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut guard = self
            .cache
            .state
            .lock()
            .expect("auth cache mutex poisoned");
        guard.refresh_in_progress = false;
        guard.last_result = Some((
            self.generation,
            Err(AuthCacheError("refresh cancelled".to_string())),
        ));
        drop(guard);
        self.cache.notify.notify_waiters();
    }
}
