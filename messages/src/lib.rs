//! Wire message types for VEIL node-to-node communication.
//!
//! Every frame exchanged between nodes is one [`WireMessage`]. The peer
//! read loop decodes incoming frames as `WireMessage` and dispatches on the
//! variant; anything that fails to decode is a protocol violation.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use veil_types::{
    BbsMsgId, BlockHeader, BlockId, ContextHash, Height, NodeId, Timestamp, Transaction,
    TxFingerprint,
};

// ---------------------------------------------------------------------------
// Login flags
// ---------------------------------------------------------------------------

/// Capability bits advertised in [`WireMessage::Login`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginFlags(pub u32);

impl LoginFlags {
    /// Relays transactions (dandelion stem targets must have this).
    pub const SPREADING_TRANSACTIONS: u32 = 0x01;
    /// Stores and replicates bulletin-board messages.
    pub const BBS: u32 = 0x02;
    /// Willing to exchange peer addresses.
    pub const SEND_PEERS: u32 = 0x04;
    /// Participates in mining.
    pub const MINING: u32 = 0x08;
    /// Authenticated with the owner key.
    pub const OWNER: u32 = 0x10;
    /// Authenticated with a viewer key.
    pub const VIEWER: u32 = 0x20;

    pub fn contains(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn with(mut self, bit: u32) -> Self {
        self.0 |= bit;
        self
    }
}

// ---------------------------------------------------------------------------
// Disconnect reasons
// ---------------------------------------------------------------------------

/// Coded reason attached to a `Bye` before closing a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ByeReason {
    /// Orderly shutdown.
    Stopping,
    /// Peer is banned in the address book.
    Banned,
    /// Repeated request or pong timeouts.
    Timeout,
    /// Malformed message, unsolicited reply, or invalid signature.
    ProtocolViolation,
    /// Outbound queue exceeded the drown threshold.
    Drown,
    /// Peer requires a fork newer than our rules.
    ForkIncompatible,
    /// A session to the same node id already exists.
    DuplicateConnection,
}

// ---------------------------------------------------------------------------
// Payload structs
// ---------------------------------------------------------------------------

/// Handshake authentication: the peer proves ownership of its node id by
/// signing the nonce we sent during the secure-channel setup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authentication {
    pub node_id: NodeId,
    pub nonce_signature: Vec<u8>,
}

/// A bulletin-board message as carried on the wire and persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BbsMessage {
    pub channel: u64,
    pub timestamp: Timestamp,
    pub payload: Vec<u8>,
}

/// An address-book entry announced via `PeerInfo`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub id: NodeId,
    pub addr: SocketAddr,
}

// ---------------------------------------------------------------------------
// The wire enum
// ---------------------------------------------------------------------------

/// Top-level P2P wire message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    // -- Session ---------------------------------------------------------
    Authentication(Authentication),
    Bye {
        reason: ByeReason,
    },
    Ping,
    Pong,
    Login {
        flags: LoginFlags,
        min_peer_fork: Height,
    },
    /// Our own reachable listen port (the remote pairs it with the
    /// observed source address).
    PeerInfoSelf {
        port: u16,
    },
    /// Announcement of another known-good peer.
    PeerInfo(PeerAddress),
    GetExternalAddr,
    ExternalAddr {
        addr: SocketAddr,
    },

    // -- Chain -----------------------------------------------------------
    NewTip {
        header: BlockHeader,
    },
    GetHdr {
        id: BlockId,
    },
    Hdr {
        header: BlockHeader,
    },
    /// Request up to `count` headers ending at `top`, walking parents.
    GetHdrPack {
        top: BlockId,
        count: u32,
    },
    /// Headers in ascending height order.
    HdrPack {
        headers: Vec<BlockHeader>,
    },
    EnumHdrs {
        min_height: Height,
        max_height: Height,
    },
    GetBody {
        id: BlockId,
    },
    Body {
        body: Vec<u8>,
    },
    /// Request bodies for `count` blocks ending at `top`, bounded by
    /// `max_size` response bytes.
    GetBodyPack {
        top: BlockId,
        count: u32,
        max_size: u32,
    },
    BodyPack {
        bodies: Vec<Vec<u8>>,
    },
    /// The peer does not have the requested data.
    DataMissing,
    /// Find the highest block id both sides share.
    GetCommonState {
        ids: Vec<BlockId>,
    },
    CommonState {
        id: Option<BlockId>,
    },
    GetProofState {
        height: Height,
    },
    GetProofChainWork,

    // -- Proofs (opaque to the orchestrator, served by the Processor) ----
    GetProofKernel {
        kernel_id: [u8; 32],
    },
    GetProofKernel2 {
        kernel_id: [u8; 32],
        fetch_kernel: bool,
    },
    GetProofUtxo {
        #[serde(with = "veil_types::serde_array33")]
        commitment: [u8; 33],
    },
    GetProofShieldedOutp {
        serial: [u8; 32],
    },
    GetProofShieldedInp {
        serial: [u8; 32],
    },
    GetProofAsset {
        asset_id: u32,
    },
    GetShieldedList {
        id0: u64,
        count: u32,
    },
    GetShieldedOutputsAt {
        height: Height,
    },
    /// Generic proof reply; `None` mirrors `DataMissing` for proof queries.
    Proof {
        data: Option<Vec<u8>>,
    },

    // -- Transactions ----------------------------------------------------
    NewTransaction {
        tx: Transaction,
        fluff: bool,
        context: Option<ContextHash>,
    },
    HaveTransaction {
        id: TxFingerprint,
    },
    GetTransaction {
        id: TxFingerprint,
    },

    // -- BBS -------------------------------------------------------------
    BbsMsg(BbsMessage),
    BbsHaveMsg {
        id: BbsMsgId,
    },
    BbsGetMsg {
        id: BbsMsgId,
    },
    BbsSubscribe {
        channel: u64,
        time_from: Timestamp,
        on: bool,
    },
    BbsResetSync {
        time_from: Timestamp,
    },

    // -- Events & contracts (opaque, served by the Processor) ------------
    GetEvents {
        height_from: Height,
    },
    Events {
        data: Vec<u8>,
    },
    GetStateSummary,
    StateSummary {
        data: Vec<u8>,
    },
    ContractVarsEnum {
        key_min: Vec<u8>,
        key_max: Vec<u8>,
    },
    ContractLogsEnum {
        key_min: Vec<u8>,
        key_max: Vec<u8>,
        pos_min: u64,
        pos_max: u64,
    },
    GetContractVar {
        key: Vec<u8>,
    },
    GetContractLogProof {
        pos: u64,
    },

    // -- Dependent transactions ------------------------------------------
    /// Peer selects the dependent context it builds on; `None` asks for
    /// the node's current best context.
    SetDependentContext {
        context: Option<ContextHash>,
    },
    DependentContextState {
        best: Option<ContextHash>,
    },
}

impl WireMessage {
    /// Whether this message is only valid after a completed login.
    pub fn requires_login(&self) -> bool {
        !matches!(
            self,
            WireMessage::Authentication(_)
                | WireMessage::Login { .. }
                | WireMessage::Bye { .. }
                | WireMessage::Ping
                | WireMessage::Pong
        )
    }
}
