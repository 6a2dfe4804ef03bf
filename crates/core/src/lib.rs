//! Domain logic for relaying issue-tracker webhooks to subscriber blocks.
//!
//! Everything in this crate is free of I/O: the field catalog cache, the
//! custom-field normalizer, webhook classification, subscription routing,
//! and outbound event shaping.

pub mod events;
pub mod fields;
pub mod normalizer;
pub mod outbound;
pub mod routing;

pub use events::{classify, ClassifiedEvent, MessageBody, WebhookEventType};
pub use fields::{FieldMap, FieldMetadata, FieldMetadataCache};
pub use normalizer::{CustomFieldSet, FieldValueNormalizer, NormalizedValue};
pub use outbound::OutboundEvent;
pub use routing::{route, FilterConfig, SubscriptionError, WebhookSubscription};
