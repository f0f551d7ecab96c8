//! AirDrop Interop Protocol Engine
//!
//! An interoperable peer implementation of Apple's AirDrop file-transfer
//! protocol for non-Apple hosts: dual-channel discovery (BLE beacon +
//! mDNS), mutual-TLS peer links, and the three-phase
//! `/Discover` → `/Ask` → `/Upload` exchange over HTTP/2, with explicit
//! per-transfer user consent.
//!
//! The engine is UI-free: it emits peer and transfer events over
//! channels and consults an approval callback before accepting bytes.
//! Platform specifics (BLE advertising, Wi-Fi Direct) plug in through the
//! [`discovery::BleRadio`] and [`link::PeerLinkProvider`] traits.

pub mod client;
pub mod config;
pub mod device;
pub mod discovery;
pub mod fs_utils;
pub mod identity;
pub mod link;
pub mod proto;
pub mod registry;
pub mod server;
pub mod tls;
pub mod transfer;

mod error;

pub use client::AirDropClient;
pub use config::{AirDropConfig, Visibility, DEFAULT_BUFFER_SIZE, DEFAULT_PORT};
pub use device::{DeviceClass, PeerRecord, PeerSighting, SightingSource};
pub use discovery::{
    BleRadio, BtleplugRadio, DiscoveryCoordinator, DiscoveryEvent, MdnsService,
};
pub use error::{AirDropError, Result};
pub use identity::{compute_identity_hash, Certificate, CertificateStore, LocalIdentity};
pub use link::{
    PeerLink, PeerLinkListener, PeerLinkManager, PeerLinkProvider, TcpLinkListener,
    TcpLinkProvider,
};
pub use registry::{DeviceRegistry, RegistryEvent};
pub use server::AirDropServer;
pub use tls::{GuardedStream, TlsGuard};
pub use transfer::{
    ApprovalCallback, ApprovalDecision, CancelHandle, FileDescriptor, TransferDirection,
    TransferEvent, TransferManager, TransferManagerConfig, TransferProgress, TransferRecord,
    TransferState,
};
