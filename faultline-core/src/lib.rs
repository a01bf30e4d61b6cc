pub mod duration;
pub mod error;
pub mod events;
pub mod metadata;
pub mod property;
pub mod traits;

pub use error::*;
pub use events::*;
pub use metadata::*;
pub use property::*;
pub use traits::*;
