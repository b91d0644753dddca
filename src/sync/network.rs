use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkSignal {
    WentOnline,
    WentOffline,
}

#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

pub struct HttpProbe {
    url: String,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn is_reachable(&self) -> bool {
        match self.client.head(&self.url).send().await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("Connectivity probe to {} failed: {}", self.url, e);
                false
            }
        }
    }
}

struct MonitorState {
    online: AtomicBool,
    signals: broadcast::Sender<NetworkSignal>,
}

#[derive(Clone)]
pub struct NetworkMonitor {
    state: Arc<MonitorState>,
}

impl NetworkMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (signals, _) = broadcast::channel(16);
        Self {
            state: Arc::new(MonitorState {
                online: AtomicBool::new(initially_online),
                signals,
            }),
        }
    }

    pub async fn from_probe<P: ConnectivityProbe + ?Sized>(probe: &P) -> Self {
        let online = probe.is_reachable().await;
        tracing::info!("Starting {}", if online { "online" } else { "offline" });
        Self::new(online)
    }

    pub fn is_online(&self) -> bool {
        self.state.online.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkSignal> {
        self.state.signals.subscribe()
    }

    /// Records the observed connectivity and emits a signal only on a change.
    pub fn report(&self, online: bool) -> Option<NetworkSignal> {
        let previous = self.state.online.swap(online, Ordering::SeqCst);
        if previous == online {
            return None;
        }

        let signal = if online {
            tracing::info!("Connectivity restored");
            NetworkSignal::WentOnline
        } else {
            tracing::warn!("Connectivity lost");
            NetworkSignal::WentOffline
        };
        // No subscribers is fine; the level is still recorded.
        let _ = self.state.signals.send(signal);
        Some(signal)
    }
}

pub fn spawn_probe_loop<P>(monitor: NetworkMonitor, probe: Arc<P>, interval: Duration) -> JoinHandle<()>
where
    P: ConnectivityProbe + ?Sized + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let online = probe.is_reachable().await;
            monitor.report(online);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct FixedProbe(AtomicBool);

    #[async_trait]
    impl ConnectivityProbe for FixedProbe {
        async fn is_reachable(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn initial_state_matches_constructor() {
        assert!(NetworkMonitor::new(true).is_online());
        assert!(!NetworkMonitor::new(false).is_online());
    }

    #[tokio::test]
    async fn initial_state_matches_probe() {
        let probe = FixedProbe(AtomicBool::new(false));

        let monitor = NetworkMonitor::from_probe(&probe).await;

        assert!(!monitor.is_online());
    }

    #[test]
    fn repeated_reports_emit_once_per_transition() {
        let monitor = NetworkMonitor::new(true);
        let mut signals = monitor.subscribe();

        assert_eq!(monitor.report(true), None);
        assert_eq!(monitor.report(false), Some(NetworkSignal::WentOffline));
        assert_eq!(monitor.report(false), None);
        assert_eq!(monitor.report(true), Some(NetworkSignal::WentOnline));

        assert_eq!(signals.try_recv().unwrap(), NetworkSignal::WentOffline);
        assert_eq!(signals.try_recv().unwrap(), NetworkSignal::WentOnline);
        assert!(signals.try_recv().is_err());
    }

    #[test]
    fn clones_share_state() {
        let monitor = NetworkMonitor::new(false);
        let clone = monitor.clone();

        clone.report(true);

        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn probe_loop_reports_transitions() {
        let monitor = NetworkMonitor::new(true);
        let mut signals = monitor.subscribe();
        let probe = Arc::new(FixedProbe(AtomicBool::new(false)));

        let handle = spawn_probe_loop(monitor.clone(), probe.clone(), Duration::from_millis(10));
        let first = tokio::time::timeout(Duration::from_secs(2), signals.recv()).await;
        probe.0.store(true, Ordering::SeqCst);
        let second = tokio::time::timeout(Duration::from_secs(2), signals.recv()).await;
        handle.abort();

        assert_eq!(first.unwrap().unwrap(), NetworkSignal::WentOffline);
        assert_eq!(second.unwrap().unwrap(), NetworkSignal::WentOnline);
    }

    #[tokio::test]
    async fn http_probe_detects_reachable_server() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let probe = HttpProbe::new(server.uri(), reqwest::Client::new());

        assert!(probe.is_reachable().await);
    }

    #[tokio::test]
    async fn http_probe_detects_unreachable_server() {
        let probe = HttpProbe::new("http://127.0.0.1:1", reqwest::Client::new());

        assert!(!probe.is_reachable().await);
    }
}
