//! Body size accounting.
//!
//! Trimmed from the teacher's `body.rs`, which layers `Stream`-based
//! `RequestBody`/`ResponseBody`/`BoxStream` types atop [`BodySize`] for
//! async handler consumption. This crate's handlers pull request content
//! through [`InputPump`](crate::input::InputPump) and push response content
//! through [`OutputPipeline`](crate::output::OutputPipeline) directly as
//! [`Bytes`] chunks, so only the size-hint classification survives -- it is
//! exactly what decides whether a response gets a `Content-Length` header,
//! chunked framing, or connection-close framing (spec.md §6/§7, Property P4).

/// Body size hint, matching the three framing outcomes Transport must choose
/// between.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BodySize {
    /// Absence of body can be assumed from method or status code.
    ///
    /// Will skip writing Content-Length header.
    None,
    /// Known size body.
    ///
    /// Will write `Content-Length: N` header.
    Sized(usize),
    /// Unknown size body.
    ///
    /// Will not write Content-Length header. Can be used with chunked Transfer-Encoding.
    Stream,
}
