//! Periodic advertising sync and Periodic Advertising Sync Transfer.
//!
//! The controller accepts one Create Sync at a time. Requests wait in a FIFO;
//! only the head is ever outstanding, guarded by the establishment timer.

use super::event::GapNotification;
use super::inquiry::InquiryDb;
use super::timer::TimerKind;
use super::topology::{GapRole, ALL_SCAN_MASK};
use super::Radio;
use crate::address::{AddrType, BdAddr};
use crate::hci::{
    bit_is_set, AclDirectory, BigInfoReport, HciCommand, IdentityResolver, PeriodicReport,
    SyncEstablished, SyncTransferReceived, HCI_ERR_ADVERTISING_TIMEOUT,
    HCI_ERR_COMMAND_DISALLOWED, HCI_SUCCESS, LE_FEATURE_PAST_RECIPIENT,
};
use crate::{GapError, GapResult, GapStatus};
use serde::Serialize;
use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Sync to any CTE type
const SYNC_CTE_TYPE_ANY: u8 = 0x07;
/// Use sid/address from the command, no periodic advertiser list
const SYNC_OPTIONS_NONE: u8 = 0x00;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Sync to SID {sid} of {addr} already requested")]
    Duplicate { sid: u8, addr: BdAddr },
    #[error("No free periodic sync slot")]
    TableFull,
    #[error("Periodic sync request queue full")]
    QueueFull,
    #[error("No free sync transfer slot")]
    TransferTableFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Queued behind another request
    Idle,
    /// Create Sync sent, waiting for establishment
    Pending,
    Established,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncSession {
    pub sid: u8,
    pub addr: BdAddr,
    pub state: SyncState,
    pub sync_handle: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SyncRequest {
    busy: bool,
    sid: u8,
    addr: BdAddr,
    skip: u16,
    timeout: u16,
}

#[derive(Debug, Clone, Copy)]
struct Transfer {
    conn_handle: u16,
    peer: BdAddr,
}

#[derive(Debug)]
pub struct SyncOrchestrator {
    sessions: Vec<Option<SyncSession>>,
    queue: VecDeque<SyncRequest>,
    capacity: usize,
    transfers: Vec<Option<Transfer>>,
    past_receive_registered: bool,
}

impl SyncOrchestrator {
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: vec![None; capacity],
            queue: VecDeque::with_capacity(capacity),
            capacity,
            transfers: vec![None; capacity],
            past_receive_registered: false,
        }
    }

    pub fn sessions(&self) -> impl Iterator<Item = &SyncSession> {
        self.sessions.iter().flatten()
    }

    pub fn session(&self, sid: u8, addr: &BdAddr) -> Option<&SyncSession> {
        self.sessions().find(|s| s.sid == sid && s.addr == *addr)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Request whose Create Sync is outstanding
    pub fn outstanding(&self) -> Option<(u8, BdAddr)> {
        self.queue
            .front()
            .filter(|r| r.busy)
            .map(|r| (r.sid, r.addr))
    }

    fn session_index(&self, sid: u8, addr: &BdAddr) -> Option<usize> {
        self.sessions
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.sid == sid && s.addr == *addr))
    }

    fn established_index(&self, sync_handle: u16) -> Option<usize> {
        self.sessions.iter().position(|s| {
            s.as_ref().is_some_and(|s| {
                s.state == SyncState::Established && s.sync_handle == sync_handle
            })
        })
    }

    fn peer_addr_type(db: &InquiryDb, addr: &BdAddr) -> AddrType {
        db.find(addr)
            .map(|r| r.addr_type)
            .unwrap_or(AddrType::Random)
    }

    fn failed(sid: u8, addr: BdAddr, addr_type: AddrType, status: u8) -> GapNotification {
        GapNotification::SyncStarted {
            status,
            sync_handle: 0,
            sid,
            addr_type,
            addr,
            phy: 0,
            interval: 0,
        }
    }

    /// Queue a sync to (`sid`, `addr`)
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start_sync(
        &mut self,
        radio: &mut Radio,
        resolver: &dyn IdentityResolver,
        db: &InquiryDb,
        sid: u8,
        addr: BdAddr,
        skip: u16,
        timeout: u16,
    ) -> GapResult {
        if self.session_index(sid, &addr).is_some() {
            return Err(SyncError::Duplicate { sid, addr }.into());
        }
        let slot = self
            .sessions
            .iter()
            .position(Option::is_none)
            .ok_or(SyncError::TableFull)?;
        if self.queue.len() >= self.capacity {
            return Err(SyncError::QueueFull.into());
        }

        self.sessions[slot] = Some(SyncSession {
            sid,
            addr,
            state: SyncState::Idle,
            sync_handle: 0,
        });
        self.queue.push_back(SyncRequest {
            busy: false,
            sid,
            addr,
            skip,
            timeout,
        });
        debug!("Queued periodic sync to SID {} of {} ({} queued)", sid, addr, self.queue.len());

        self.queue_next(radio, resolver, db);
        Ok(GapStatus::Started)
    }

    /// Scanning must be running, or allowed to run, for a sync to establish
    fn scan_gate_open(radio: &Radio) -> bool {
        radio.topology.mask() & ALL_SCAN_MASK != 0
            || radio.topology.check(&radio.caps, GapRole::PassiveScan).is_ok()
    }

    /// Send Create Sync for the head of the queue unless one is outstanding
    fn queue_next(&mut self, radio: &mut Radio, resolver: &dyn IdentityResolver, db: &InquiryDb) {
        loop {
            let request = match self.queue.front_mut() {
                Some(head) if !head.busy => {
                    head.busy = true;
                    *head
                }
                _ => return,
            };
            radio.timers.cancel(TimerKind::SyncEstablish);

            if !Self::scan_gate_open(radio) {
                warn!(
                    "Periodic sync to SID {} of {} refused: scanning not allowed",
                    request.sid, request.addr
                );
                let addr_type = Self::peer_addr_type(db, &request.addr);
                radio.notify(Self::failed(
                    request.sid,
                    request.addr,
                    addr_type,
                    HCI_ERR_COMMAND_DISALLOWED,
                ));
                if let Some(i) = self.session_index(request.sid, &request.addr) {
                    self.sessions[i] = None;
                }
                self.queue.pop_front();
                continue;
            }

            let mut addr = request.addr;
            let mut addr_type = Self::peer_addr_type(db, &addr);
            if let Some(identity) = resolver.identity_of(&addr) {
                debug!("Syncing to {} by identity {}", addr, identity.addr);
                addr = identity.addr;
                addr_type = identity.addr_type;
            }

            radio.send(HciCommand::PeriodicCreateSync {
                options: SYNC_OPTIONS_NONE,
                sid: request.sid,
                addr_type: addr_type.without_identity(),
                addr,
                skip: request.skip,
                timeout: request.timeout,
                cte_type: SYNC_CTE_TYPE_ANY,
            });
            if let Some(i) = self.session_index(request.sid, &request.addr) {
                if let Some(session) = self.sessions[i].as_mut() {
                    session.state = SyncState::Pending;
                }
            }
            radio
                .timers
                .arm(TimerKind::SyncEstablish, radio.config.sync_timeout());
            return;
        }
    }

    pub(crate) fn on_sync_established(
        &mut self,
        radio: &mut Radio,
        resolver: &dyn IdentityResolver,
        db: &InquiryDb,
        evt: SyncEstablished,
    ) {
        let mut addr = evt.addr;
        let mut addr_type = evt.addr_type;
        if addr_type.is_identity() {
            if let Some(pseudo) = resolver.pseudo_of(&addr) {
                addr = pseudo.addr;
                addr_type = pseudo.addr_type;
            }
        }

        // A late event for a request that already timed out must not complete
        // whatever is outstanding now.
        let head_matches = self
            .queue
            .front()
            .is_some_and(|h| h.busy && h.sid == evt.sid && h.addr == addr);
        if head_matches {
            radio.timers.cancel(TimerKind::SyncEstablish);
            self.queue.pop_front();
        }

        // Only the request that sent this Create Sync may complete. A session
        // under the same key that is still queued belongs to a later start.
        let pending = self.session_index(evt.sid, &addr).filter(|&i| {
            self.sessions[i]
                .as_ref()
                .is_some_and(|s| s.state == SyncState::Pending)
        });
        match pending.filter(|_| head_matches) {
            Some(i) => {
                if evt.status == HCI_SUCCESS {
                    if let Some(session) = self.sessions[i].as_mut() {
                        session.sync_handle = evt.sync_handle;
                        session.state = SyncState::Established;
                    }
                    info!(
                        "Periodic sync 0x{:04x} established to SID {} of {}",
                        evt.sync_handle, evt.sid, addr
                    );
                } else {
                    warn!(
                        "Periodic sync to SID {} of {} failed: 0x{:02x}",
                        evt.sid, addr, evt.status
                    );
                    self.sessions[i] = None;
                }
                radio.notify(GapNotification::SyncStarted {
                    status: evt.status,
                    sync_handle: evt.sync_handle,
                    sid: evt.sid,
                    addr_type,
                    addr,
                    phy: evt.phy,
                    interval: evt.interval,
                });
            }
            None => {
                if evt.status == HCI_SUCCESS {
                    debug!("Terminating unrequested sync 0x{:04x}", evt.sync_handle);
                    radio.send(HciCommand::PeriodicTerminateSync {
                        sync_handle: evt.sync_handle,
                    });
                }
            }
        }

        if head_matches {
            self.queue_next(radio, resolver, db);
        }
    }

    /// Establishment timer fired for the outstanding request
    pub(crate) fn on_sync_timeout(
        &mut self,
        radio: &mut Radio,
        resolver: &dyn IdentityResolver,
        db: &InquiryDb,
    ) {
        let Some(head) = self.queue.pop_front() else {
            return;
        };
        let pending = self
            .session_index(head.sid, &head.addr)
            .filter(|&i| self.sessions[i].as_ref().is_some_and(|s| s.state == SyncState::Pending));
        if let Some(i) = pending {
            warn!("Periodic sync to SID {} of {} timed out", head.sid, head.addr);
            radio.send(HciCommand::PeriodicCreateSyncCancel);
            let addr_type = Self::peer_addr_type(db, &head.addr);
            radio.notify(Self::failed(
                head.sid,
                head.addr,
                addr_type,
                HCI_ERR_ADVERTISING_TIMEOUT,
            ));
            self.sessions[i] = None;
        }
        self.queue_next(radio, resolver, db);
    }

    pub(crate) fn on_periodic_report(&mut self, radio: &mut Radio, report: PeriodicReport) {
        if self.established_index(report.sync_handle).is_none() {
            debug!("Periodic report for unknown sync 0x{:04x}", report.sync_handle);
            return;
        }
        radio.notify(GapNotification::SyncReport {
            sync_handle: report.sync_handle,
            tx_power: report.tx_power,
            rssi: report.rssi,
            data_status: report.data_status,
            data: report.data,
        });
    }

    pub(crate) fn on_big_info(&mut self, radio: &mut Radio, report: BigInfoReport) {
        if self.established_index(report.sync_handle).is_none() {
            debug!("BIGInfo for unknown sync 0x{:04x}", report.sync_handle);
            return;
        }
        radio.notify(GapNotification::BigInfo(report));
    }

    pub(crate) fn on_sync_lost(&mut self, radio: &mut Radio, sync_handle: u16) {
        match self.established_index(sync_handle) {
            Some(i) => {
                info!("Periodic sync 0x{:04x} lost", sync_handle);
                self.sessions[i] = None;
                radio.notify(GapNotification::SyncLost { sync_handle });
            }
            None => debug!("Sync lost for unknown handle 0x{:04x}", sync_handle),
        }
    }

    pub(crate) fn stop_sync(&mut self, radio: &mut Radio, sync_handle: u16) -> GapResult {
        match self.established_index(sync_handle) {
            Some(i) => {
                self.sessions[i] = None;
                radio.send(HciCommand::PeriodicTerminateSync { sync_handle });
                info!("Periodic sync 0x{:04x} terminated", sync_handle);
            }
            None => debug!("Stop for unknown sync 0x{:04x} ignored", sync_handle),
        }
        Ok(GapStatus::Success)
    }

    /// Withdraw a sync request, whatever stage it reached
    pub(crate) fn cancel_sync(&mut self, radio: &mut Radio, sid: u8, addr: BdAddr) -> GapResult {
        let Some(i) = self.session_index(sid, &addr) else {
            debug!("Cancel for unknown sync to SID {} of {} ignored", sid, addr);
            return Ok(GapStatus::Success);
        };
        let Some(session) = self.sessions[i].take() else {
            return Ok(GapStatus::Success);
        };

        match session.state {
            // The head stays busy until the controller reports the outcome
            SyncState::Pending => radio.send(HciCommand::PeriodicCreateSyncCancel),
            SyncState::Idle => self
                .queue
                .retain(|r| r.busy || !(r.sid == sid && r.addr == addr)),
            SyncState::Established => radio.send(HciCommand::PeriodicTerminateSync {
                sync_handle: session.sync_handle,
            }),
        }
        info!("Periodic sync to SID {} of {} cancelled ({:?})", sid, addr, session.state);
        Ok(GapStatus::Success)
    }

    // ------------------------------------------------------------------------
    // Sync transfer
    // ------------------------------------------------------------------------

    fn past_connection(acl: &dyn AclDirectory, peer: BdAddr) -> Result<u16, GapError> {
        let conn_handle = acl
            .le_connection_handle(&peer)
            .ok_or(GapError::UnknownAddress(peer))?;
        let features = acl.peer_le_features(&peer).unwrap_or_default();
        if !bit_is_set(&features, LE_FEATURE_PAST_RECIPIENT) {
            return Err(GapError::PeerUnsupported(peer));
        }
        Ok(conn_handle)
    }

    fn reserve_transfer(&mut self, conn_handle: u16, peer: BdAddr) -> Result<(), SyncError> {
        let slot = self
            .transfers
            .iter()
            .position(Option::is_none)
            .ok_or(SyncError::TransferTableFull)?;
        self.transfers[slot] = Some(Transfer { conn_handle, peer });
        Ok(())
    }

    /// Hand an established sync over to a connected peer
    pub(crate) fn transfer_sync(
        &mut self,
        radio: &mut Radio,
        acl: &dyn AclDirectory,
        peer: BdAddr,
        service_data: u16,
        sync_handle: u16,
    ) -> GapResult {
        let conn_handle = Self::past_connection(acl, peer)?;
        self.reserve_transfer(conn_handle, peer)?;
        radio.send(HciCommand::PeriodicSyncTransfer {
            conn_handle,
            service_data,
            sync_handle,
        });
        Ok(GapStatus::Started)
    }

    /// Send a peer the sync info of one of our own advertising sets
    pub(crate) fn transfer_set_info(
        &mut self,
        radio: &mut Radio,
        acl: &dyn AclDirectory,
        peer: BdAddr,
        service_data: u16,
        adv_handle: u8,
    ) -> GapResult {
        let conn_handle = Self::past_connection(acl, peer)?;
        self.reserve_transfer(conn_handle, peer)?;
        radio.send(HciCommand::PeriodicSetInfoTransfer {
            conn_handle,
            service_data,
            adv_handle,
        });
        Ok(GapStatus::Started)
    }

    pub(crate) fn on_past_complete(&mut self, radio: &mut Radio, conn_handle: u16, status: u8) {
        let slot = self
            .transfers
            .iter()
            .position(|t| t.is_some_and(|t| t.conn_handle == conn_handle));
        match slot.and_then(|i| self.transfers[i].take()) {
            Some(transfer) => radio.notify(GapNotification::SyncTransferComplete {
                status,
                peer: transfer.peer,
            }),
            None => debug!("Transfer completion for unknown connection 0x{:04x}", conn_handle),
        }
    }

    /// Accept syncs transferred by `peer` from now on
    pub(crate) fn set_sync_transfer_params(
        &mut self,
        radio: &mut Radio,
        acl: &dyn AclDirectory,
        peer: BdAddr,
        mode: u8,
        skip: u16,
        timeout: u16,
    ) -> GapResult {
        let conn_handle = acl
            .le_connection_handle(&peer)
            .ok_or(GapError::UnknownAddress(peer))?;
        radio.send(HciCommand::SetPastParams {
            conn_handle,
            mode,
            skip,
            timeout,
            cte_type: SYNC_CTE_TYPE_ANY,
        });
        self.past_receive_registered = true;
        Ok(GapStatus::Started)
    }

    pub(crate) fn on_sync_transfer_received(&mut self, radio: &mut Radio, evt: SyncTransferReceived) {
        if evt.status == HCI_SUCCESS && self.session_index(evt.sid, &evt.addr).is_some() {
            info!(
                "Transferred sync 0x{:04x} duplicates SID {} of {}, terminating",
                evt.sync_handle, evt.sid, evt.addr
            );
            radio.send(HciCommand::PeriodicTerminateSync {
                sync_handle: evt.sync_handle,
            });
            return;
        }
        if evt.status == HCI_SUCCESS {
            match self.sessions.iter().position(Option::is_none) {
                Some(slot) => {
                    self.sessions[slot] = Some(SyncSession {
                        sid: evt.sid,
                        addr: evt.addr,
                        state: SyncState::Established,
                        sync_handle: evt.sync_handle,
                    });
                }
                None => warn!("No slot for transferred sync 0x{:04x}", evt.sync_handle),
            }
        }
        if self.past_receive_registered {
            radio.notify(GapNotification::SyncTransferReceived(evt));
        } else {
            debug!("Sync transfer received without registration");
        }
    }
}
