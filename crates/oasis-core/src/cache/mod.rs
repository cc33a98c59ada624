//! In-process caches

pub mod profile_cache;

pub use profile_cache::{
    ProfileCache, ProfileFeed, ProfileLease, ProfileSink, ProfileSnapshot, Unsubscribe,
};
