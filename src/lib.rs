//! Mediation and routing core for idemio products.
//!
//! Messages travel through routes as [`Exchange`]s. A route runs a
//! [`Pipeline`] of steps, each either synchronous ([`processor::Processor`])
//! or asynchronous ([`processor::AsyncProcessor`]), and the integration
//! patterns in [`eip`] plug in as ordinary steps. A [`MediationContext`] owns
//! the routes, registries and in-flight tracking of one deployment.

pub mod config;
pub mod context;
pub mod eip;
pub mod exchange;
pub mod expression;
pub mod logger;
pub mod pipeline;
pub mod processor;
pub mod route;
pub mod status;

pub use config::EngineConfig;
pub use context::{MediationContext, ShutdownResult};
pub use exchange::{Exchange, ExchangeError, Message};
pub use pipeline::Pipeline;
pub use processor::{AsyncCallback, AsyncProcessor, Executable, Processor};
pub use route::Route;
