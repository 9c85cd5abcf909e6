//! Ingestors: each turns one external signal into typed events in the store.

pub mod command_receiver;
pub mod discovery;
pub mod file_watcher;
pub mod git_context;
pub mod host_log;
pub mod process_sampler;

pub use command_receiver::CommandReceiver;
pub use file_watcher::FileWatcher;
pub use git_context::GitContextTracker;
pub use host_log::create_host_log_collector;
pub use process_sampler::ProcessSampler;
