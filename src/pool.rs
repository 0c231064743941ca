//! Bounded pool of reusable browser processes. Idle browsers are reused
//! LIFO; acquirers beyond capacity wait FIFO, each with its own deadline.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::driver::{BrowserHandle, BrowserLauncher};
use crate::error::AgentError;

pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 30_000;

struct PoolState {
    live: Vec<Arc<dyn BrowserHandle>>,
    idle: Vec<Arc<dyn BrowserHandle>>,
    waiters: VecDeque<oneshot::Sender<Arc<dyn BrowserHandle>>>,
    closed: bool,
}

impl PoolState {
    fn drop_from_live(&mut self, browser: &Arc<dyn BrowserHandle>) {
        self.live.retain(|b| !Arc::ptr_eq(b, browser));
        self.idle.retain(|b| !Arc::ptr_eq(b, browser));
    }
}

pub struct BrowserPool {
    launcher: Arc<dyn BrowserLauncher>,
    max: usize,
    acquire_timeout_ms: u64,
    state: Arc<Mutex<PoolState>>,
}

impl BrowserPool {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, max: usize) -> Self {
        Self {
            launcher,
            max: max.max(1),
            acquire_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT_MS,
            state: Arc::new(Mutex::new(PoolState {
                live: Vec::new(),
                idle: Vec::new(),
                waiters: VecDeque::new(),
                closed: false,
            })),
        }
    }

    pub fn with_acquire_timeout(mut self, timeout_ms: u64) -> Self {
        self.acquire_timeout_ms = timeout_ms;
        self
    }

    /// Borrow a browser: reuse an idle one, launch below capacity, otherwise
    /// join the FIFO wait queue until a release or the per-wait deadline.
    pub async fn acquire(&self) -> Result<Arc<dyn BrowserHandle>, AgentError> {
        let rx = {
            let mut st = self.state.lock().await;
            if st.closed {
                return Err(AgentError::Pool("pool is closed".into()));
            }

            while let Some(candidate) = st.idle.pop() {
                if candidate.is_connected() {
                    return Ok(candidate);
                }
                st.drop_from_live(&candidate);
                debug!("dropped disconnected idle browser");
            }

            if st.live.len() < self.max {
                let browser = self.launcher.launch().await?;
                st.live.push(browser.clone());
                drop(st);
                self.watch_disconnect(browser.clone());
                return Ok(browser);
            }

            let (tx, rx) = oneshot::channel();
            st.waiters.push_back(tx);
            rx
        };

        match tokio::time::timeout(Duration::from_millis(self.acquire_timeout_ms), rx).await {
            Ok(Ok(browser)) => Ok(browser),
            Ok(Err(_)) => Err(AgentError::Pool("pool closed while waiting".into())),
            Err(_) => Err(AgentError::Pool(format!(
                "acquire timeout after {} ms",
                self.acquire_timeout_ms
            ))),
        }
    }

    /// Return a borrowed browser. Pending waiters are served directly;
    /// disconnected browsers are dropped; on a closed pool the browser is
    /// closed instead.
    pub async fn release(&self, browser: Arc<dyn BrowserHandle>) {
        let mut st = self.state.lock().await;
        if st.closed {
            drop(st);
            browser.close().await;
            return;
        }
        if !browser.is_connected() {
            st.drop_from_live(&browser);
            return;
        }
        let mut browser = browser;
        while let Some(waiter) = st.waiters.pop_front() {
            match waiter.send(browser) {
                Ok(()) => return,
                // The waiter gave up (deadline); try the next one.
                Err(returned) => browser = returned,
            }
        }
        st.idle.push(browser);
    }

    /// Close the pool: reject queued waiters and close every live browser
    /// concurrently. Idempotent; a closed pool is never reopened.
    pub async fn close(&self) {
        let browsers = {
            let mut st = self.state.lock().await;
            if st.closed {
                return;
            }
            st.closed = true;
            st.waiters.clear();
            st.idle.clear();
            std::mem::take(&mut st.live)
        };
        futures::future::join_all(browsers.iter().map(|b| b.close())).await;
    }

    fn watch_disconnect(&self, browser: Arc<dyn BrowserHandle>) {
        let state: Weak<Mutex<PoolState>> = Arc::downgrade(&self.state);
        tokio::spawn(async move {
            browser.wait_disconnected().await;
            if let Some(state) = state.upgrade() {
                let mut st = state.lock().await;
                st.drop_from_live(&browser);
                warn!("browser disconnected; removed from pool");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::watch;

    use crate::driver::{NoopPage, PageDriver, PageOptions};

    #[derive(Debug)]
    struct FakeBrowser {
        connected: watch::Sender<bool>,
    }

    impl FakeBrowser {
        fn new() -> Self {
            let (tx, _) = watch::channel(false);
            Self { connected: tx }
        }

        fn disconnect(&self) {
            let _ = self.connected.send(true);
        }
    }

    #[async_trait]
    impl BrowserHandle for FakeBrowser {
        fn is_connected(&self) -> bool {
            !*self.connected.borrow()
        }
        async fn new_page(&self, _opts: &PageOptions) -> Result<Box<dyn PageDriver>, AgentError> {
            Ok(Box::new(NoopPage))
        }
        async fn wait_disconnected(&self) {
            let mut rx = self.connected.subscribe();
            let _ = rx.wait_for(|disconnected| *disconnected).await;
        }
        async fn close(&self) {
            self.disconnect();
        }
    }

    #[derive(Default)]
    struct FakeLauncher {
        launched: AtomicUsize,
    }

    #[async_trait]
    impl BrowserLauncher for FakeLauncher {
        async fn launch(&self) -> Result<Arc<dyn BrowserHandle>, AgentError> {
            self.launched.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeBrowser::new()))
        }
    }

    fn pool(max: usize, timeout_ms: u64) -> (BrowserPool, Arc<FakeLauncher>) {
        let launcher = Arc::new(FakeLauncher::default());
        let pool = BrowserPool::new(launcher.clone(), max).with_acquire_timeout(timeout_ms);
        (pool, launcher)
    }

    #[tokio::test]
    async fn released_browsers_are_reused() {
        let (pool, launcher) = pool(2, 1_000);
        let a = pool.acquire().await.unwrap();
        pool.release(a.clone()).await;
        let b = pool.acquire().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn capacity_blocks_and_release_hands_off_to_waiter() {
        let (pool, launcher) = pool(1, 5_000);
        let pool = Arc::new(pool);
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.release(held.clone()).await;

        let got = waiter.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&held, &got));
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn acquire_times_out_at_capacity() {
        let (pool, _) = pool(1, 100);
        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, AgentError::Pool(_)));
        assert!(err.to_string().contains("timeout"));
    }

    #[tokio::test]
    async fn disconnected_browsers_are_replaced() {
        let (pool, launcher) = pool(1, 1_000);
        let a = pool.acquire().await.unwrap();
        // Simulate a crash while checked out.
        a.close().await;
        pool.release(a).await;
        let b = pool.acquire().await.unwrap();
        assert!(b.is_connected());
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn close_rejects_waiters_and_is_idempotent() {
        let (pool, _) = pool(1, 5_000);
        let pool = Arc::new(pool);
        let _held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.close().await;
        pool.close().await;

        assert!(waiter.await.unwrap().is_err());
        assert!(pool.acquire().await.is_err());
    }

    #[tokio::test]
    async fn disconnect_watcher_removes_idle_browsers() {
        let (pool, launcher) = pool(1, 1_000);
        let a = pool.acquire().await.unwrap();
        pool.release(a.clone()).await;
        a.close().await;
        // Give the watcher task a chance to run.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let b = pool.acquire().await.unwrap();
        assert!(b.is_connected());
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 2);
    }
}
