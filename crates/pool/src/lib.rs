//! # Nebula Pool
//!
//! Producer and polling-consumer pooling for the Nebula message routing
//! engine. Provides per-endpoint pools for shared and exclusive resources,
//! a recency-bounded cache that sheds least recently used endpoints, a
//! weak-referenced cache for non-owning lookups, and the producer/consumer
//! cache facades used to send and receive exchanges.

pub mod cache;
pub mod config;
pub mod consumer_cache;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod exchange;
mod facade;
pub mod lifecycle;
pub mod pool;
pub mod producer_cache;
pub mod statistics;
pub mod template;
pub mod testing;

pub use cache::{CacheStats, LruCache, WeakCache};
pub use config::{CacheSize, ContextConfig, DEFAULT_MAX_POOL_SIZE, PoolConfig};
pub use consumer_cache::ConsumerCache;
pub use context::{Context, LifecycleAuthority};
pub use endpoint::{AsyncCallback, Endpoint, PollingConsumer, Pooled, Processor, Producer};
pub use error::{Error, Result};
pub use events::{EventBus, PoolEvent};
pub use exchange::{Exchange, ExchangePattern, TO_ENDPOINT};
pub use lifecycle::{Service, ServiceStatus, ServiceSupport, stop_and_deregister};
pub use pool::ServicePool;
pub use producer_cache::ProducerCache;
pub use statistics::EndpointUtilizationStatistics;
pub use template::{EndpointResolver, ProducerTemplate};
