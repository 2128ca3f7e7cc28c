//! Native window embedding interface.
//!
//! Opening the foreign editor reparents the child's top-level window into
//! the host-supplied parent and announces it over the XEmbed client-message
//! protocol. The bridge core only drives the sequence; the actual display
//! calls live behind [`WindowEmbedder`] so deployments plug in their
//! windowing backend and headless setups run without one.

/// XEmbed client-message codes consumed by embedder implementations.
pub const XEMBED_EMBEDDED_NOTIFY: i64 = 0;
pub const XEMBED_FOCUS_OUT: i64 = 5;

/// Display-side operations performed while opening the editor, in the
/// order the bridge invokes them: `resize_parent`, `reparent`,
/// `embedded_notify`, `focus_out`, and finally `map` once the child has
/// shown its window.
pub trait WindowEmbedder: Send + Sync {
    fn resize_parent(&self, parent: u64, width: u32, height: u32);
    fn reparent(&self, child: u64, parent: u64);
    fn embedded_notify(&self, child: u64, parent: u64);
    fn focus_out(&self, child: u64);
    fn map(&self, child: u64);
}

/// Embedder that logs and discards every operation. Used headless and in
/// tests; a real deployment supplies an Xlib-backed implementation.
pub struct DiscardEmbedder;

impl WindowEmbedder for DiscardEmbedder {
    fn resize_parent(&self, parent: u64, width: u32, height: u32) {
        tracing::debug!(parent, width, height, "resize_parent discarded");
    }

    fn reparent(&self, child: u64, parent: u64) {
        tracing::debug!(child, parent, "reparent discarded");
    }

    fn embedded_notify(&self, child: u64, parent: u64) {
        tracing::debug!(child, parent, "embedded_notify discarded");
    }

    fn focus_out(&self, child: u64) {
        tracing::debug!(child, "focus_out discarded");
    }

    fn map(&self, child: u64) {
        tracing::debug!(child, "map discarded");
    }
}
