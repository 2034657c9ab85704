pub mod error;
pub mod text_ext;

pub use error::{ApiError, ApiResult};
pub use text_ext::{hangul_ratio, normalize_digits, truncate_chars};
