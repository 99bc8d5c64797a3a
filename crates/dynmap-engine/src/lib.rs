//! Per-message transformation pipeline for dynmap.
//!
//! A message flows through the [`MappingEngine`]: the topic is resolved
//! against the published mapping tree, each matching mapping extracts values
//! from the payload ([`extraction`]) and assembles an ordered list of
//! [`PlatformRequest`]s ([`assembly`]), resolving device identity through an
//! [`IdentityResolver`] on the way.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dynmap_core::{Api, EngineConfig, Mapping, Substitution};
//! use dynmap_engine::{InMemoryIdentityResolver, MappingEngine};
//!
//! # async fn run() -> dynmap_core::Result<()> {
//! let engine = MappingEngine::new(
//!     EngineConfig::from_env(),
//!     Arc::new(InMemoryIdentityResolver::new()),
//! );
//! engine.upsert_mapping(
//!     Mapping::new("device/+/temperature", Api::Measurement)
//!         .with_target_template(r#"{"c8y_Temperature": {"T": {"value": 0}}}"#)
//!         .with_substitution(Substitution::new("_TOPIC_LEVEL_[1]", "_IDENTITY_.c8ySourceId"))
//!         .with_substitution(Substitution::new("/value", "c8y_Temperature.T.value")),
//! )?;
//!
//! for ctx in engine.process_inbound("device/123/temperature", br#"{"value": 21.5}"#).await {
//!     for request in ctx.requests {
//!         println!("{:?} {}", request.method, request.request_body);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod assembly;
pub mod clock;
pub mod context;
pub mod engine;
pub mod extraction;
pub mod identity;
pub mod path;
pub mod payload;
pub mod request;
pub mod value;

pub use clock::{Clock, FixedClock, SystemClock};
pub use context::ProcessingContext;
pub use engine::{MappingEngine, RebuildReport};
pub use identity::{
    CachingIdentityResolver, DeviceHints, ExternalId, IdentityResolver, InMemoryIdentityResolver,
    PlatformId,
};
pub use request::{PlatformRequest, RequestMethod};
pub use value::{SubstituteValue, ValueKind};
