//! Adaptive request admission controller.
//!
//! Embeds in front of an API or microservice layer and decides, per
//! `(client, route)` pair, whether to admit or reject each request
//! according to a configured rate-limit policy. Four algorithms (token
//! bucket, leaky bucket, sliding-window counter, adaptive window), scoped
//! policies with `(client, route) > client > route > default` precedence,
//! and a background monitor that sweeps stale state and rewrites limits in
//! response to observed rejection rates.
//!
//! ```no_run
//! use aegis_shield::{Shield, ShieldConfig};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> anyhow::Result<()> {
//! let shield = Shield::new(ShieldConfig::default())?;
//! shield.set_route_limit("/api/search", 20, Some(10), None)?;
//!
//! if shield.admit("client-42", Some("/api/search")) {
//!     // handle the request
//! } else {
//!     // respond 429
//! }
//! # shield.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod policy;
pub mod shield;
pub mod telemetry;

pub use config::ShieldConfig;
pub use error::{RateLimitExceeded, ShieldError};
pub use limiter::{KeyStats, KeyedLimiter};
pub use metrics::{FrameSnapshot, GlobalStats, Telemetry};
pub use policy::{AlgorithmKind, Policy, PolicyScope, ResolvedPolicy, ScopedLimit};
pub use shield::{ClientStats, RouteStats, Shield};
