pub mod entities;
pub mod messages;
pub mod messaging;
pub mod repositories;

pub use entities::*;
pub use messages::*;
pub use messaging::*;
pub use repositories::*;
pub use screening_errors::{ScreeningError, ScreeningResult};
