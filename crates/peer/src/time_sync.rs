//! NTP-style four-timestamp, one-round clock offset estimation.

/// The four timestamps exchanged during a handshake's time-sync round, all
/// nanoseconds since an arbitrary but shared epoch (the host's clock at
/// process start is as good as any — only the differences matter).
#[derive(Debug, Clone, Copy)]
pub struct RoundTripTimestamps {
    /// T1: host's send time for `LocalPeerConnected`.
    pub host_sent: i64,
    /// T2: client's receipt time for that message.
    pub client_received: i64,
    /// T3: client's send time for `RequestTimeSync`.
    pub client_sent: i64,
    /// T4: host's receipt time for that message.
    pub host_received: i64,
}

impl RoundTripTimestamps {
    /// `offsetNs = ((T2 - T1) + (T3 - T4)) / 2`, the host→client clock
    /// offset: add this to a host timestamp to get the equivalent client
    /// timestamp.
    ///
    /// # Test
    ///
    /// ```
    /// use netcode_peer::time_sync::RoundTripTimestamps;
    ///
    /// // Client's clock reads exactly 500ms ahead of the host's, no travel delay.
    /// let stamps = RoundTripTimestamps {
    ///     host_sent: 1_000_000_000,
    ///     client_received: 1_500_000_000,
    ///     client_sent: 1_500_000_000,
    ///     host_received: 1_000_000_000,
    /// };
    /// assert_eq!(stamps.host_to_client_offset_nanos(), 500_000_000);
    /// ```
    pub fn host_to_client_offset_nanos(&self) -> i64 {
        ((self.client_received - self.host_sent) + (self.client_sent - self.host_received)) / 2
    }

    /// The reply the host sends back: the client→host offset, which is
    /// simply the negation of the host→client one.
    pub fn client_to_host_offset_nanos(&self) -> i64 {
        -self.host_to_client_offset_nanos()
    }
}

/// Per-connection clock offset state, held by both sides once the time-sync
/// round has completed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClockOffset {
    nanos: i64,
}

impl ClockOffset {
    pub fn from_nanos(nanos: i64) -> Self {
        Self { nanos }
    }

    /// `ConvertHostTimestampToLocal` / `ConvertClientTimestampToLocal`.
    pub fn convert_to_local(&self, remote_timestamp_nanos: i64) -> i64 {
        remote_timestamp_nanos + self.nanos
    }

    /// The inverse of [`convert_to_local`](Self::convert_to_local):
    /// `ConvertLocalTimestampToHost`.
    pub fn convert_to_remote(&self, local_timestamp_nanos: i64) -> i64 {
        local_timestamp_nanos - self.nanos
    }
}
