//! Federation module
//!
//! Everything involved in exchanging signed activities with remote
//! peer servers:
//! - HTTP signature generation and encrypted key handling (signer)
//! - SSRF-protected outbound HTTP (fetch)
//! - Audience resolution from activity addressing (audience)
//! - Concurrent signed delivery with retry (delivery)
//! - Dead-letter queue for exhausted deliveries (dead_letter)
//! - Remote public stream polling (poller)

pub mod audience;
pub mod dead_letter;
pub mod delivery;
pub mod fetch;
pub mod poller;
pub mod signer;

pub use audience::{Addressing, AudienceResolver, PUBLIC_SENTINEL};
pub use dead_letter::{backoff_delay_ms, DeadLetterQueue, SweepReport};
pub use delivery::{DeliveryEngine, DeliveryFailure, DeliveryReport, OutboundActivity};
pub use fetch::{FetchResponse, SafeFetch, SafeFetcher};
pub use poller::InstancePoller;
pub use signer::{sign_request, KeyStore, SignatureHeaders};
