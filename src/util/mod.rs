//! Utility functions for common operations.
//!
//! - **URL validation**: vetting redirect targets before a feed is re-keyed
//! - **Locator normalization**: mapping bare paths onto `file:` locators
//! - **Text**: flattening feed-supplied strings for terminal output
//!
//! # Examples
//!
//! ```
//! use gleaner::util::{normalize_locator, validate_absolute_url};
//!
//! assert!(validate_absolute_url("https://example.com/feed.xml").is_ok());
//! assert_eq!(normalize_locator("feeds/local.xml"), "file:feeds/local.xml");
//! ```

mod text;
mod url_validator;

pub use text::one_line;
pub use url_validator::{
    file_locator_path, normalize_locator, validate_absolute_url, UrlValidationError,
};
