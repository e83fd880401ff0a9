//! High-level client: sessions, datasets and elements

mod dataset;
mod element;
mod session;

pub use dataset::{Dataset, ElementStream};
pub use element::Element;
pub use session::Session;
