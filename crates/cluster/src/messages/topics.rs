//! Topic constants for the rendezvous protocol.
//!
//! Topics follow the pattern `s2gpp.cluster.<frame>`.

// ── Sub → Main ────────────────────────────────────────────────────────────

/// First frame on every connection: the sub introduces itself.
pub const HELLO: &str = "s2gpp.cluster.hello";

/// Window scores for the sub's assigned column range.
pub const RESULT: &str = "s2gpp.cluster.result";

// ── Main → Sub ────────────────────────────────────────────────────────────

/// The coordinator refuses the connection; it is closed right after.
pub const REJECT: &str = "s2gpp.cluster.reject";

/// Work for one sub: column range, parameters and the column slice.
pub const ASSIGNMENT: &str = "s2gpp.cluster.assignment";
