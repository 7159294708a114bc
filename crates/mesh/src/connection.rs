//! Connection establishment over the secure-channel provider.
//!
//! A link is committed only after the provider has produced a session key.
//! Provider errors and handshake timeouts abort without leaving anything
//! behind in the topology; the caller decides whether to retry.

use crate::error::{MeshError, MeshResult};
use crate::link::{ChannelQuality, Connection, ConnectionStatus, ConnectionType, SecurityBinding};
use crate::registry::RegistryNotifier;
use crate::topology::TopologyStore;
use qmesh_core::{current_timestamp_ms, ConnectionConfig, EventBuilder, EventKind, EventSeverity};
use qmesh_crypto::{SecureChannelProvider, SessionId, SessionKey};
use std::sync::Arc;

/// Negotiates secured links between known nodes.
pub struct ConnectionEstablisher {
    store: TopologyStore,
    channel: Arc<dyn SecureChannelProvider>,
    registry: RegistryNotifier,
    config: ConnectionConfig,
}

impl ConnectionEstablisher {
    pub fn new(
        store: TopologyStore,
        channel: Arc<dyn SecureChannelProvider>,
        registry: RegistryNotifier,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            store,
            channel,
            registry,
            config,
        }
    }

    /// Establish a direct link between two nodes.
    pub async fn establish(&self, source: &str, target: &str) -> MeshResult<Connection> {
        self.establish_at(source, target, ConnectionType::Direct, current_timestamp_ms())
            .await
    }

    /// Establish a link of the given type.
    pub async fn establish_with_type(
        &self,
        source: &str,
        target: &str,
        connection_type: ConnectionType,
    ) -> MeshResult<Connection> {
        self.establish_at(source, target, connection_type, current_timestamp_ms())
            .await
    }

    /// Establish a link at `now`. Returns the existing connection if the pair
    /// is already joined by an active one.
    pub async fn establish_at(
        &self,
        source: &str,
        target: &str,
        connection_type: ConnectionType,
        now: u64,
    ) -> MeshResult<Connection> {
        if source == target {
            return Err(MeshError::InvalidRequest(format!(
                "cannot connect {source} to itself"
            )));
        }
        let snapshot = self.store.snapshot();
        for id in [source, target] {
            if !snapshot.nodes.contains_key(id) {
                return Err(MeshError::unknown_node(id));
            }
        }
        if let Some(existing) = snapshot
            .connection_between(source, target)
            .filter(|c| c.status == ConnectionStatus::Active)
        {
            return Ok(existing.clone());
        }
        for id in [source, target] {
            let used = snapshot.live_connections_of(id).len();
            let limit = snapshot.nodes[id].capabilities.max_secure_channels as usize;
            if used >= limit {
                return Err(self.record_failure(
                    source,
                    target,
                    format!("{id} has no free secure channels ({used}/{limit})"),
                    now,
                ));
            }
        }
        drop(snapshot);

        let key = match self.open_session(target).await {
            Ok(key) => key,
            Err(e) => return Err(self.record_failure(source, target, e.to_string(), now)),
        };

        let connection = Connection::active(
            source,
            target,
            connection_type,
            ChannelQuality::from(key.metrics),
            self.binding_for(&key, now),
            now,
        );

        let (connection, inserted) = match self.store.insert_connection_if_absent(connection) {
            Ok(result) => result,
            Err(e) => {
                // An endpoint vanished while the handshake was in flight.
                self.channel.close_session(&key.session_id).await;
                return Err(e);
            }
        };
        if !inserted {
            self.channel.close_session(&key.session_id).await;
            return Ok(connection);
        }

        tracing::info!(
            connection_id = %connection.id,
            from = source,
            to = target,
            error_rate = connection.quality.error_rate,
            key_rate = connection.quality.key_rate,
            "Connection established"
        );
        self.store.append_event(
            EventBuilder::new(EventKind::ConnectionEstablished, "connection")
                .at(now)
                .entity(source)
                .entity(target)
                .entity(connection.id.clone())
                .message(format!("{source} <-> {target} active"))
                .payload("error_rate", connection.quality.error_rate)
                .payload("key_rate", connection.quality.key_rate)
                .build(),
        );
        self.registry.connection_established(&connection).await;
        Ok(connection)
    }

    /// Replace the session key of a live connection.
    pub async fn rotate_session_key(&self, connection_id: &str) -> MeshResult<Connection> {
        self.rotate_session_key_at(connection_id, current_timestamp_ms())
            .await
    }

    /// Replace the session key of a live connection at `now`.
    pub async fn rotate_session_key_at(&self, connection_id: &str, now: u64) -> MeshResult<Connection> {
        let connection = self
            .store
            .connection(connection_id)
            .ok_or_else(|| MeshError::unknown_connection(connection_id))?;
        if !connection.status.is_live() {
            return Err(MeshError::InvalidRequest(format!(
                "connection {connection_id} is not live"
            )));
        }

        let key = self.open_session(&connection.target).await?;
        let previous = match self
            .store
            .update_security(connection_id, self.binding_for(&key, now))
        {
            Ok(previous) => previous,
            Err(e) => {
                self.channel.close_session(&key.session_id).await;
                return Err(e);
            }
        };
        self.channel.close_session(&previous.session_id).await;

        tracing::info!(connection_id, fingerprint = %key.fingerprint(), "Session key rotated");
        self.store.append_event(
            EventBuilder::new(EventKind::KeyRotated, "connection")
                .at(now)
                .entity(connection_id)
                .message(format!("session key of {connection_id} rotated"))
                .build(),
        );
        self.store
            .connection(connection_id)
            .ok_or_else(|| MeshError::unknown_connection(connection_id))
    }

    /// Close the provider sessions of connections that left the live
    /// topology. Unknown sessions are ignored by the provider.
    pub async fn release_sessions(&self, sessions: &[SessionId]) {
        for session_id in sessions {
            self.channel.close_session(session_id).await;
        }
        if !sessions.is_empty() {
            tracing::debug!(count = sessions.len(), "Released secure sessions");
        }
    }

    async fn open_session(&self, peer: &str) -> MeshResult<SessionKey> {
        let timeout = self.config.handshake_timeout();
        let session_id = tokio::time::timeout(
            timeout,
            self.channel.start_secure_session(peer, self.config.key_bits),
        )
        .await
        .map_err(|_| MeshError::ConnectionFailed {
            source_id: String::new(),
            target_id: peer.to_string(),
            reason: format!("handshake timed out after {} ms", timeout.as_millis()),
        })??;

        match self.channel.get_session_key(&session_id).await {
            Some(key) => Ok(key),
            None => {
                self.channel.close_session(&session_id).await;
                Err(MeshError::Provider(qmesh_crypto::CryptoError::UnknownSession(
                    session_id.to_string(),
                )))
            }
        }
    }

    fn binding_for(&self, key: &SessionKey, now: u64) -> SecurityBinding {
        SecurityBinding {
            session_id: key.session_id.clone(),
            key_fingerprint: key.fingerprint(),
            key_bits: key.bit_length,
            rotation_interval_ms: self.config.key_rotation_secs * 1000,
            last_rotation: now,
        }
    }

    fn record_failure(&self, source: &str, target: &str, reason: String, now: u64) -> MeshError {
        tracing::warn!(from = source, to = target, reason = %reason, "Connection failed");
        self.store.append_event(
            EventBuilder::new(EventKind::ConnectionFailed, "connection")
                .at(now)
                .severity(EventSeverity::Warning)
                .entity(source)
                .entity(target)
                .message(format!("{source} <-> {target} failed: {reason}"))
                .build(),
        );
        MeshError::ConnectionFailed {
            source_id: source.to_string(),
            target_id: target.to_string(),
            reason,
        }
    }
}
