pub mod claude;
pub mod error;
pub mod schema;
pub mod traits;
pub mod util;
pub mod voyage;

pub use claude::Claude;
pub use error::AiError;
pub use schema::StructuredOutput;
pub use traits::{EmbedAgent, RerankAgent};
pub use util::{json_object_span, strip_code_blocks};
pub use voyage::{RerankScore, Voyage};
