//! # evreader
//!
//! An input stack for evdev-style devices, sitting between the kernel's
//! event character devices and a higher-level dispatcher.
//!
//! The crate has two tightly coupled halves:
//!
//! - The [`hub`]: discovers and opens device nodes, classifies each device
//!   by capability, multiplexes raw reads across all devices with a single
//!   blocking wait, and publishes a totally ordered stream of raw events and
//!   device lifecycle notifications. It holds a wake lock at all times
//!   except across the wait, so the system can suspend only while input is
//!   idle.
//! - The [`reader`]: maintains a stack of per-capability mappers for every
//!   device that cook raw events into key, motion and switch notifications.
//!   The touch pipeline handles calibration, display-space transformation,
//!   virtual keys, pointer-id tracking across frames, and multi-finger
//!   pointer gestures for touchpads that drive a cursor.
//!
//! ## Usage
//!
//! The embedder supplies the collaborators: a [`keymap::KeyLayout`] provider
//! for scan-code translation, a [`policy::Policy`] for display geometry and
//! pointer controllers, and a [`listener::Listener`] receiving the cooked
//! stream. A dedicated thread then drives the loop:
//!
//! ```no_run
//! # use std::sync::Arc;
//! use evreader::env::EnvironmentConfig;
//! use evreader::hub::{EventHub, KeyLayoutProvider};
//! use evreader::reader::InputReader;
//! # struct NoLayouts;
//! # impl KeyLayoutProvider for NoLayouts {
//! #     fn load(
//! #         &self,
//! #         _: &evreader::hub::InputDeviceIdentifier,
//! #         _: &evreader::properties::PropertyMap,
//! #     ) -> Option<Arc<dyn evreader::keymap::KeyLayout>> {
//! #         None
//! #     }
//! # }
//! # fn policy() -> Arc<dyn evreader::policy::Policy> { unimplemented!() }
//! # fn listener() -> Box<dyn evreader::listener::Listener> { unimplemented!() }
//!
//! let hub = Arc::new(EventHub::new(EnvironmentConfig::default(), Arc::new(NoLayouts)).unwrap());
//! let reader = InputReader::new(hub, policy(), listener());
//! std::thread::spawn(move || loop {
//!     reader.loop_once();
//! });
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod codes;
pub mod env;
pub mod hub;
pub mod keymap;
pub mod listener;
pub mod policy;
pub mod properties;
pub mod reader;
pub mod utils;

pub use crate::codes::{ButtonState, KeyAction, KeyState, MetaState, PolicyFlags, Source};
pub use crate::env::EnvironmentConfig;
pub use crate::hub::{EventHub, RawEvent, RawEventKind, RawEventSource};
pub use crate::listener::{Listener, NotifyArgs};
pub use crate::policy::{Policy, ReaderConfiguration};
pub use crate::reader::InputReader;
