//! # Event Bus Module
//!
//! Publish/subscribe distribution of session events. Publishers emit typed
//! events without knowing who is listening; subscribers filter by category
//! and receive either synchronously or over a broadcast channel.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mppckit_core::event_bus::{event_bus, DeviceEvent, EventCategory, EventFilter, SafetyEvent};
//!
//! let subscription = event_bus().subscribe(
//!     EventFilter::Categories(vec![EventCategory::Safety]),
//!     |event| {
//!         if let DeviceEvent::Safety(e) = event {
//!             println!("safety: {:?}", e);
//!         }
//!     },
//! );
//!
//! event_bus().publish(DeviceEvent::Safety(SafetyEvent::TripReset));
//!
//! event_bus().unsubscribe(subscription);
//! ```

mod bus;
mod events;

pub use bus::*;
pub use events::*;
