use crate::history::HistoryAggregator;
use crate::persist::ResponsePersister;
use crate::search::SimilaritySearch;
use crate::store::Store;
use crate::streaming::StreamRelay;
use crate::upstream::{AgentEndpoints, UpstreamClient, UpstreamConfig};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value = "moldrelay.db")]
    pub database: String,
    /// Budget for the agent's response headers and for each streamed chunk.
    #[arg(long, default_value_t = crate::constants::STREAM_TIMEOUT_SECS)]
    pub stream_timeout_secs: u64,
    #[arg(long, default_value_t = crate::constants::CHAT_TIMEOUT_SECS)]
    pub chat_timeout_secs: u64,
    #[arg(long, default_value_t = crate::constants::SEARCH_TIMEOUT_SECS)]
    pub search_timeout_secs: u64,
    #[arg(long, default_value_t = crate::constants::CONNECT_TIMEOUT_SECS)]
    pub connect_timeout_secs: u64,
    /// Attempts per upstream call, the first one included.
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,
    #[arg(long, default_value_t = 250)]
    pub retry_base_delay_ms: u64,
    /// How long a relay waits for its response to be saved.
    #[arg(long, default_value_t = crate::constants::RENDEZVOUS_TIMEOUT_SECS)]
    pub rendezvous_timeout_secs: u64,
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    pub max_body_size: usize,
    #[arg(long, default_value = "logs")]
    pub log_dir: String,
}

impl Default for Args {
    fn default() -> Self {
        Self::parse_from(["moldrelay"])
    }
}

impl Args {
    pub fn upstream_config(&self) -> UpstreamConfig {
        UpstreamConfig {
            stream_timeout: Duration::from_secs(self.stream_timeout_secs),
            chat_timeout: Duration::from_secs(self.chat_timeout_secs),
            search_timeout: Duration::from_secs(self.search_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            max_attempts: self.max_retries,
            retry_base_delay_ms: self.retry_base_delay_ms,
        }
    }

    pub fn rendezvous_timeout(&self) -> Duration {
        Duration::from_secs(self.rendezvous_timeout_secs)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub history: HistoryAggregator,
    pub relay: StreamRelay,
    pub upstream: UpstreamClient,
    pub persister: ResponsePersister,
    pub search: SimilaritySearch,
    pub endpoints: AgentEndpoints,
    pub args: Arc<Args>,
}

impl AppState {
    /// Wires the services around one store and one upstream client.
    pub fn new(
        store: Store,
        upstream: UpstreamClient,
        endpoints: AgentEndpoints,
        args: Arc<Args>,
    ) -> Self {
        let persister = ResponsePersister::new(store.clone());
        let relay = StreamRelay::new(upstream.clone(), persister.clone())
            .with_rendezvous_timeout(args.rendezvous_timeout());
        Self {
            history: HistoryAggregator::new(store.clone()),
            search: SimilaritySearch::new(upstream.clone(), store.clone()),
            store,
            relay,
            upstream,
            persister,
            endpoints,
            args,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_relay_budgets() {
        let args = Args::default();
        let cfg = args.upstream_config();
        assert_eq!(cfg.stream_timeout, Duration::from_secs(70));
        assert_eq!(cfg.chat_timeout, Duration::from_secs(50));
        assert_eq!(cfg.connect_timeout, Duration::from_secs(10));
        assert_eq!(cfg.search_timeout, Duration::from_secs(10));
        assert_eq!(args.database, "moldrelay.db");
    }

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from(["moldrelay", "--port", "9000", "--stream-timeout-secs", "5"]);
        assert_eq!(args.port, 9000);
        assert_eq!(args.upstream_config().stream_timeout, Duration::from_secs(5));
    }
}
