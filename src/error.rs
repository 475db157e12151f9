// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Crate-wide error type. One variant per error kind from the behavior
//! contract: configuration, polygon validation, source lifecycle, backend
//! lifecycle, resource exhaustion, delivery, and internal invariants.

use thiserror::Error;

/// Why a polygon (ROI) failed validation, kept distinct from the message
/// string so callers can match on the reason directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PolygonInvalidReason {
    #[error("fewer than 3 vertices")]
    InsufficientPoints,
    #[error("a vertex lies outside the declared frame bounds")]
    CoordOutOfRange,
    #[error("polygon area is below the configured minimum")]
    AreaTooSmall,
    #[error("polygon edges self-intersect")]
    SelfIntersection,
    #[error("polygon is required to be convex but is not")]
    NotConvex,
}

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("Configuration error: {0}")]
    ConfigInvalid(String),

    #[error("Polygon invalid: {reason} (area={area:.2})")]
    PolygonInvalid {
        reason: PolygonInvalidReason,
        area: f64,
    },

    #[error("Source '{id}' unreachable: {reason}")]
    SourceUnreachable { id: String, reason: String },

    #[error("Source '{id}' authentication rejected: {reason}")]
    SourceAuth { id: String, reason: String },

    #[error("Source '{id}' transient failure: {reason}")]
    SourceTransient { id: String, reason: String },

    #[error("No inference backend could be initialized: {0}")]
    BackendInitFailed(String),

    #[error("Inference backend runtime failure: {0}")]
    BackendRuntime(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Alarm delivery failed on channel '{channel}': {reason}")]
    DeliveryFailed { channel: String, reason: String },

    #[error("Internal invariant violated: {0}")]
    Internal(String),

    #[error("Pipeline '{id}' not found")]
    PipelineNotFound { id: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AnalyticsError>;
