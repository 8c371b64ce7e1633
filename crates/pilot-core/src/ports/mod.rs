//! Ports - 抽象化レイヤー
//!
//! Each trait is a seam towards something outside the process: the shared
//! document store, wall-clock time, id generation, and the infrastructure that
//! launches worker jobs.

pub mod clock;
pub mod document_store;
pub mod id_generator;
pub mod launcher;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::document_store::{
    Document, DocumentStore, Revision, ViewOptions, ViewResult, ViewRow,
};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::launcher::JobLauncher;
