// src/api/rate_limiter.rs
//! Admission control for outbound requests.
//!
//! Two caps gate every network attempt sequence:
//! - at most `max_concurrent` admitted requests at any instant
//! - at most `max_per_window` admissions inside the trailing `window`
//!
//! Admission is granted through [`AdmissionPermit`], an RAII guard that
//! releases the concurrency slot on drop, so every exit path (success, error,
//! cancellation, panic unwinding) gives the slot back exactly once.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;

/// Rate limit configuration for the shared backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_concurrent: usize,
    pub max_per_window: usize,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 12,
            max_per_window: 30,
            window: Duration::from_secs(1),
        }
    }
}

/// Admission controller shared by every request issued through one client.
#[derive(Clone)]
pub struct AdmissionController {
    config: RateLimitConfig,
    // Sliding window of admission instants. The mutex is the single
    // coordination point: window check and timestamp insert happen under it.
    window: Arc<Mutex<VecDeque<Instant>>>,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
    total_admitted: Arc<AtomicU64>,
}

impl AdmissionController {
    pub fn new(config: RateLimitConfig) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        info!(
            "🚦 Initializing admission control: {} concurrent, {} per {:?}",
            max_concurrent, config.max_per_window, config.window
        );

        Self {
            window: Arc::new(Mutex::new(VecDeque::with_capacity(config.max_per_window))),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
            total_admitted: Arc::new(AtomicU64::new(0)),
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Suspends until both caps allow one more request, then admits it.
    ///
    /// Only fails when `cancel` fires while waiting; there is no timeout here,
    /// the caller's own deadline bounds the wait.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<AdmissionPermit, ApiError> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ApiError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| ApiError::Config("admission controller closed".to_string()))?
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ApiError::Cancelled),
            _ = self.claim_window_slot() => {}
        }

        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        self.total_admitted.fetch_add(1, Ordering::Relaxed);
        debug!("✅ Admitted request ({} in flight)", now_in_flight);

        Ok(AdmissionPermit {
            _permit: permit,
            in_flight: self.in_flight.clone(),
            admitted_at: Instant::now(),
        })
    }

    /// Waits for room in the sliding window and records the admission.
    /// The window lock is never held across the wait.
    async fn claim_window_slot(&self) {
        loop {
            let wake_at = {
                let mut window = self.window.lock().await;
                let now = Instant::now();
                while let Some(oldest) = window.front() {
                    if now.duration_since(*oldest) >= self.config.window {
                        window.pop_front();
                    } else {
                        break;
                    }
                }

                if window.len() < self.config.max_per_window.max(1) {
                    window.push_back(now);
                    return;
                }

                let wake_at = match window.front() {
                    Some(oldest) => *oldest + self.config.window,
                    None => now,
                };
                debug!(
                    "⏳ Rate window full ({}/{}), waiting {:?}",
                    window.len(),
                    self.config.max_per_window,
                    wake_at.saturating_duration_since(now)
                );
                wake_at
            };
            sleep_until(wake_at).await;
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Get current usage statistics
    pub async fn get_usage_stats(&self) -> RateLimitStats {
        let window = self.window.lock().await;
        let now = Instant::now();
        let window_requests = window
            .iter()
            .filter(|ts| now.duration_since(**ts) < self.config.window)
            .count();

        RateLimitStats {
            in_flight: self.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
            max_concurrent: self.config.max_concurrent,
            window_requests,
            max_per_window: self.config.max_per_window,
            available_permits: self.semaphore.available_permits(),
            total_admitted: self.total_admitted.load(Ordering::Relaxed),
        }
    }
}

/// RAII admission slot; dropping it releases the concurrency permit.
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
    admitted_at: Instant,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        debug!("🔓 Released admission slot after {:?}", self.admitted_at.elapsed());
    }
}

/// Rate limiting statistics
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStats {
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub max_concurrent: usize,
    pub window_requests: usize,
    pub max_per_window: usize,
    pub available_permits: usize,
    pub total_admitted: u64,
}

impl std::fmt::Display for RateLimitStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "admission: {}/{} in flight (peak {}), {}/{} in window, {} admitted",
            self.in_flight,
            self.max_concurrent,
            self.peak_in_flight,
            self.window_requests,
            self.max_per_window,
            self.total_admitted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn config(max_concurrent: usize, max_per_window: usize, window_ms: u64) -> RateLimitConfig {
        RateLimitConfig {
            max_concurrent,
            max_per_window,
            window: Duration::from_millis(window_ms),
        }
    }

    #[tokio::test]
    async fn test_permit_release_on_drop() {
        let limiter = AdmissionController::new(config(2, 100, 1000));
        let cancel = CancellationToken::new();

        let first = limiter.acquire(&cancel).await.unwrap();
        let second = limiter.acquire(&cancel).await.unwrap();
        assert_eq!(limiter.in_flight(), 2);

        // Third must wait until a slot frees up
        let blocked = timeout(Duration::from_millis(50), limiter.acquire(&cancel)).await;
        assert!(blocked.is_err());

        drop(first);
        let third = timeout(Duration::from_millis(100), limiter.acquire(&cancel)).await;
        assert!(third.is_ok());
        drop(second);

        let stats = limiter.get_usage_stats().await;
        assert_eq!(stats.peak_in_flight, 2);
        assert_eq!(stats.total_admitted, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_cap_delays_excess_admissions() {
        let limiter = AdmissionController::new(config(10, 3, 1000));
        let cancel = CancellationToken::new();
        let started = Instant::now();

        for _ in 0..3 {
            drop(limiter.acquire(&cancel).await.unwrap());
        }
        assert!(started.elapsed() < Duration::from_millis(10));

        // Fourth admission has to wait for the first timestamp to leave the window
        drop(limiter.acquire(&cancel).await.unwrap());
        assert!(started.elapsed() >= Duration::from_millis(1000));

        let stats = limiter.get_usage_stats().await;
        assert!(stats.window_requests <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_readable_while_window_is_full() {
        let limiter = AdmissionController::new(config(10, 1, 1000));
        let cancel = CancellationToken::new();
        drop(limiter.acquire(&cancel).await.unwrap());

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(&cancel).await.map(drop) })
        };
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        let stats = timeout(Duration::from_millis(10), limiter.get_usage_stats())
            .await
            .expect("stats must not wait for the window to drain");
        assert_eq!(stats.window_requests, 1);
        assert_eq!(stats.total_admitted, 1);

        waiter.await.unwrap().unwrap();
        assert_eq!(limiter.get_usage_stats().await.total_admitted, 2);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let limiter = AdmissionController::new(config(1, 100, 1000));
        let cancel = CancellationToken::new();
        let _held = limiter.acquire(&cancel).await.unwrap();

        let waiter_cancel = CancellationToken::new();
        let trigger = waiter_cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = timeout(Duration::from_millis(500), limiter.acquire(&waiter_cancel))
            .await
            .expect("cancellation should abort the wait promptly");
        assert!(matches!(result, Err(ApiError::Cancelled)));
        assert_eq!(limiter.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_peak_never_exceeds_cap() {
        let limiter = AdmissionController::new(config(3, 1000, 1000));
        let cancel = CancellationToken::new();

        let tasks = (0..10).map(|_| {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            async move {
                let _permit = limiter.acquire(&cancel).await.unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });
        futures::future::join_all(tasks).await;

        let stats = limiter.get_usage_stats().await;
        assert!(stats.peak_in_flight <= 3);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.total_admitted, 10);
    }
}
