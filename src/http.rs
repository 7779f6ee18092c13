//! re-export of the [`http`] crate's types, plus a few commonly used constants.
//!
//! Trimmed from the teacher's `http.rs`, which additionally layers
//! `RequestExt`/`IntoResponse` atop `::http::Request` for its `Service`-based
//! handler convention. This crate's handlers read/write through
//! [`InputPump`](crate::input::InputPump)/[`OutputPipeline`](crate::output::OutputPipeline)
//! rather than an owned generic body type, so that layer has no counterpart
//! here.

pub use ::http::*;

/// Some often used header values.
#[allow(clippy::declare_interior_mutable_const)]
pub mod const_header_value {
    use ::http::header::HeaderValue;

    macro_rules! const_value {
        ($(($ident: ident, $expr: expr)), *) => {
            $(
               pub const $ident: HeaderValue = HeaderValue::from_static($expr);
            )*
        }
    }

    const_value!(
        (TEXT, "text/plain"),
        (TEXT_UTF8, "text/plain; charset=utf-8"),
        (JSON, "application/json"),
        (TEXT_HTML_UTF8, "text/html; charset=utf-8"),
        (CLOSE, "close"),
        (CHUNKED, "chunked")
    );
}

/// Some often used header names.
#[allow(clippy::declare_interior_mutable_const)]
pub mod const_header_name {
    use ::http::header::HeaderName;

    macro_rules! const_name {
        ($(($ident: ident, $expr: expr)), *) => {
            $(
               pub const $ident: HeaderName = HeaderName::from_static($expr);
            )*
        }
    }

    const_name!((PROTOCOL, "protocol"));
}
