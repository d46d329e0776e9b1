use uuid::Uuid;

/// Per-request identifier, a UUIDv4.
pub type RequestId = Uuid;

/// Opaque identifier for a listing route.
pub type ListingId = Uuid;

/// Opaque identifier for an API key record.
pub type ApiKeyId = Uuid;

/// Opaque identifier for a buyer (owning user).
pub type BuyerId = Uuid;

/// Opaque identifier for a bundle execution session.
pub type BundleSessionId = Uuid;

/// Opaque identifier for a persisted transaction record.
pub type TransactionId = Uuid;
