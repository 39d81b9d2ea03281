strong_type!(
    /// Identifies one event queue (endpoint) at the transport layer.
    EventQueueHandle,
    u64
);
strong_type!(
    /// Identifies the transport-level connection object behind an event queue.
    ConnectionHandle,
    u64
);
strong_type!(
    /// Identifies a buffer within its pool.
    BufferId,
    u32
);
strong_type!(
    /// Key a peer must present to access a registered region remotely.
    RemoteKey,
    u64
);
