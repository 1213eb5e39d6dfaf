pub mod types;
pub mod traits;
pub mod store;
pub mod fetcher;
pub mod moderation;
pub mod publisher;
pub mod notifier;
pub mod scheduler;

pub use types::*;
pub use traits::{BroadcastClient, Classifier, DedupStore, EntrySource, FeedRegistry, Notifier};
pub use store::{connect, hash_identifier, load_or_init_cutoff, PgDedupStore, PgFeedRegistry};
pub use fetcher::FeedFetcher;
pub use moderation::{HttpClassifier, ModerationGate};
pub use publisher::{Dispatcher, HttpBroadcaster, RateGate};
pub use notifier::OpsNotifier;
pub use scheduler::{CycleStats, FeedStats, Scheduler};
