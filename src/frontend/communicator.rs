//! Parcel authentication and sealing
//!
//! The server side of the bundle exchange: resolve the claimed source to a
//! verified key, open the envelope, check the message-list signature and the
//! replay window, and keep the agent record's clock/ping/address current.

use crate::crypto::{self, CryptoError, ExchangePublic, Keypair};
use crate::frontend::cache::{
    AgentPublicKey, ClientCache, ClientHandle, PublicKeyCache, CLIENT_CACHE_SIZE,
    PUB_KEY_CACHE_SIZE,
};
use crate::frontend::message::{now_micros, AgentId, Message, Parcel, SignedMessageList};
use crate::metrics;
use crate::store::{AgentStore, StoreError};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{error, warn};
use x25519_dalek::StaticSecret;

/// Inbound timestamps this far behind the stored clock are replays.
/// Strictly monotonic checks misfire behind proxies that deliver a stale
/// bundle after its successor, hence the one-hour slack.
pub const REPLAY_WINDOW_MICROS: u64 = 3_600 * 1_000_000;

#[derive(Error, Debug)]
pub enum CommsError {
    #[error("unknown source {0}")]
    UnknownSource(AgentId),
    #[error("cipher signature invalid")]
    SignatureInvalid,
    #[error("desynchronized: timestamp {timestamp} behind clock {clock}")]
    Desynchronized { timestamp: u64, clock: u64 },
    #[error("authorization could not be established")]
    AuthUnknown,
    #[error("parcel payload: {0}")]
    Malformed(#[from] postcard::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct ServerCommunicator {
    common_name: AgentId,
    identity: Keypair,
    exchange: StaticSecret,
    store: Arc<AgentStore>,
    pub_key_cache: PublicKeyCache,
    client_cache: ClientCache,
}

impl ServerCommunicator {
    pub fn new(
        common_name: AgentId,
        identity: Keypair,
        exchange: StaticSecret,
        store: Arc<AgentStore>,
    ) -> Self {
        Self {
            common_name,
            identity,
            exchange,
            store,
            pub_key_cache: PublicKeyCache::new(PUB_KEY_CACHE_SIZE),
            client_cache: ClientCache::new(CLIENT_CACHE_SIZE),
        }
    }

    pub fn common_name(&self) -> &AgentId {
        &self.common_name
    }

    /// The server key agents seal their parcels against.
    pub fn exchange_public(&self) -> ExchangePublic {
        crypto::exchange_public(&self.exchange)
    }

    /// The server key agents verify response signatures against.
    pub fn signing_public(&self) -> &[u8] {
        self.identity.public_key()
    }

    /// Resolve the verified keys for `source`.
    ///
    /// Cache probe first; on miss the record is read from the store. A
    /// record without a certificate is an unknown agent (counted once per
    /// contact); a certificate whose subject disagrees with the record key
    /// is rejected and never auto-healed.
    pub fn remote_public_key(&self, source: &AgentId) -> Result<AgentPublicKey, CommsError> {
        if let Some(key) = self.pub_key_cache.get(source) {
            return Ok(key);
        }

        let record = self.store.load_or_default(source)?;
        let Some(cert) = record.cert.clone() else {
            metrics::UNIQUE_AGENTS.inc();
            return Err(CommsError::UnknownSource(source.clone()));
        };
        if cert.subject != source.as_str() {
            error!("stored cert mismatch for {}: subject {}", source, cert.subject);
            return Err(CommsError::UnknownSource(source.clone()));
        }

        self.client_cache
            .insert(source.clone(), Arc::new(Mutex::new(record)));
        metrics::CLIENT_CACHE_SIZE.set(self.client_cache.len() as i64);

        let key = AgentPublicKey {
            signing_key: cert.signing_key,
            exchange_key: cert.exchange_key,
        };
        self.pub_key_cache.insert(source.clone(), key.clone());
        Ok(key)
    }

    /// Authenticate an inbound parcel and return its messages.
    pub fn open_parcel(
        &self,
        parcel: &Parcel,
    ) -> Result<(Vec<Message>, AgentId, u64), CommsError> {
        let source = parcel.source.clone();
        let remote_key = self.remote_public_key(&source)?;

        let payload = crypto::open_with(
            &self.exchange,
            &parcel.ephemeral_key,
            &parcel.nonce,
            &parcel.ciphertext,
        )?;

        if !parcel.cipher_verified
            && crypto::verify(&remote_key.signing_key, &payload, &parcel.signature).is_err()
        {
            metrics::UNAUTHENTICATED_PARCELS.inc();
            return Err(CommsError::SignatureInvalid);
        }

        let list: SignedMessageList = postcard::from_bytes(&payload)?;
        if list.timestamp != parcel.timestamp {
            // The routing copy of the timestamp is unsigned; a mismatch
            // means someone rewrote it in flight.
            warn!(
                "timestamp mismatch for {}: signed {} vs routed {}",
                source, list.timestamp, parcel.timestamp
            );
            return Err(CommsError::AuthUnknown);
        }

        self.touch_agent(&source, parcel.source_ip, list.timestamp)?;
        metrics::AUTHENTICATED_PARCELS.inc();

        Ok((list.messages, source, list.timestamp))
    }

    /// Replay gate plus record upkeep for one accepted bundle.
    fn touch_agent(
        &self,
        source: &AgentId,
        source_ip: Option<IpAddr>,
        client_time: u64,
    ) -> Result<(), CommsError> {
        let handle = match self.client_cache.get(source) {
            Some(handle) => handle,
            None => {
                let record = self.store.load_or_default(source)?;
                let handle: ClientHandle = Arc::new(Mutex::new(record));
                self.client_cache.insert(source.clone(), Arc::clone(&handle));
                metrics::CLIENT_CACHE_SIZE.set(self.client_cache.len() as i64);
                handle
            }
        };

        let mut record = handle.lock().unwrap_or_else(|e| e.into_inner());
        let remote_time = record.clock;

        if client_time < remote_time.saturating_sub(REPLAY_WINDOW_MICROS) {
            warn!(
                "message desynchronized for {}: {} >= {}",
                source, remote_time, client_time
            );
            return Err(CommsError::Desynchronized {
                timestamp: client_time,
                clock: remote_time,
            });
        }

        // Advance the clock only when the agent's time moves forward; an
        // in-window older bundle is accepted but leaves the record alone.
        if client_time > remote_time {
            record.clock = client_time;
            record.ping = now_micros();
            for label in &record.labels {
                metrics::AGENT_PINGS_BY_LABEL
                    .with_label_values(&[label.as_str()])
                    .inc();
            }
        } else {
            warn!(
                "out of order message for {}: {} >= {}",
                source, remote_time, client_time
            );
        }

        record.client_ip = source_ip;
        self.store.save(source, &record)?;
        Ok(())
    }

    /// Sign and seal an outbound message list for `destination`.
    ///
    /// Fails with `UnknownSource` when the destination keys cannot be
    /// resolved; the caller is expected to reschedule the tasks it drained.
    pub fn seal_parcel(
        &self,
        messages: Vec<Message>,
        destination: &AgentId,
        timestamp: u64,
        api_version: u32,
    ) -> Result<Parcel, CommsError> {
        let remote_key = self.remote_public_key(destination)?;

        let list = SignedMessageList {
            timestamp,
            messages,
        };
        let payload = postcard::to_allocvec(&list)?;
        let signature = self.identity.sign(&payload);
        let envelope = crypto::seal_to(&remote_key.exchange_key, &payload)?;

        Ok(Parcel {
            source: self.common_name.clone(),
            source_ip: None,
            api_version,
            queue_size: 0,
            timestamp,
            ephemeral_key: envelope.ephemeral_key,
            nonce: envelope.nonce,
            ciphertext: envelope.ciphertext,
            signature,
            cipher_verified: false,
        })
    }
}

/// Build an agent-side parcel addressed to the server. Agent tooling and
/// tests use this; the server itself never does.
pub fn seal_client_parcel(
    source: &AgentId,
    identity: &Keypair,
    server_exchange: &ExchangePublic,
    list: &SignedMessageList,
    source_ip: Option<IpAddr>,
    api_version: u32,
    queue_size: u32,
) -> Result<Parcel, CommsError> {
    let payload = postcard::to_allocvec(list)?;
    let signature = identity.sign(&payload);
    let envelope = crypto::seal_to(server_exchange, &payload)?;

    Ok(Parcel {
        source: source.clone(),
        source_ip,
        api_version,
        queue_size,
        timestamp: list.timestamp,
        ephemeral_key: envelope.ephemeral_key,
        nonce: envelope.nonce,
        ciphertext: envelope.ciphertext,
        signature,
        cipher_verified: false,
    })
}

/// Agent-side decode of a server response parcel.
pub fn open_client_parcel(
    exchange: &StaticSecret,
    server_signing_key: &[u8],
    parcel: &Parcel,
) -> Result<SignedMessageList, CommsError> {
    let payload = crypto::open_with(
        exchange,
        &parcel.ephemeral_key,
        &parcel.nonce,
        &parcel.ciphertext,
    )?;
    crypto::verify(server_signing_key, &payload, &parcel.signature)
        .map_err(|_| CommsError::SignatureInvalid)?;
    Ok(postcard::from_bytes(&payload)?)
}
