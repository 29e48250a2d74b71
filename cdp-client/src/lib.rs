pub mod carver;
pub mod event_source;
pub mod http_client;
pub mod local_cache;
pub mod metadata_extractor;
pub mod reconnector;
pub mod sender;

pub use carver::{Carver, SaveEvent};
pub use event_source::{EventSource, EventSourceStop, NotifyEventSource};
pub use http_client::{HttpClient, PostOutcome};
pub use local_cache::LocalCache;
pub use metadata_extractor::MetadataExtractor;
pub use reconnector::Reconnector;
pub use sender::{Sender, SenderConfig};
