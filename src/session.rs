//! Scoped sessions with the archive
//!
//! A [`Connector`] opens one association per logical operation. The
//! returned [`AssociationSession`] releases the association when it goes out
//! of scope, on every exit path.

use std::ops::{Deref, DerefMut};

use dimse::{
    Association, DimseCommand, DimseError, DimseResponse, DimseScu, FindQuery, MoveQuery,
    RemoteNode,
};
use tracing::{debug, warn};

use crate::error::{PacsError, Result};

/// Lazily read responses of one exchange
pub type Responses<'a> = Box<dyn Iterator<Item = dimse::Result<DimseResponse>> + 'a>;

/// One open association with the archive
pub trait Session: Send {
    /// Send C-ECHO and return the raw status
    fn echo(&mut self) -> dimse::Result<u16>;

    fn find(&mut self, query: &FindQuery) -> dimse::Result<Responses<'_>>;

    fn move_request(&mut self, query: &MoveQuery) -> dimse::Result<Responses<'_>>;

    /// Release the association. Calling it again is a no-op.
    fn release(&mut self) -> dimse::Result<()>;
}

/// Opens sessions with one remote archive
pub trait Connector: Send + Sync + 'static {
    type Session: Session;

    /// Open an association negotiated for `command`
    fn open(&self, command: DimseCommand) -> dimse::Result<Self::Session>;

    /// `AE@host:port` of the archive
    fn remote(&self) -> String;

    /// Send one encoded instance to the archive with C-STORE
    fn store(
        &self,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        transfer_syntax_uid: &str,
        data: &[u8],
    ) -> dimse::Result<u16>;
}

/// [`Connector`] backed by real DIMSE associations
#[derive(Debug, Clone)]
pub struct DimseConnector {
    scu: DimseScu,
    node: RemoteNode,
}

impl DimseConnector {
    pub fn new(scu: DimseScu, node: RemoteNode) -> Self {
        Self { scu, node }
    }
}

impl Connector for DimseConnector {
    type Session = DimseSession;

    fn open(&self, command: DimseCommand) -> dimse::Result<DimseSession> {
        let association = self.scu.associate(&self.node, command)?;
        Ok(DimseSession {
            association: Some(association),
        })
    }

    fn remote(&self) -> String {
        self.node.to_string()
    }

    fn store(
        &self,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        transfer_syntax_uid: &str,
        data: &[u8],
    ) -> dimse::Result<u16> {
        self.scu.store(
            &self.node,
            sop_class_uid,
            sop_instance_uid,
            transfer_syntax_uid,
            data,
        )
    }
}

/// [`Session`] over a DIMSE association
pub struct DimseSession {
    association: Option<Association>,
}

impl DimseSession {
    fn association(&mut self) -> dimse::Result<&mut Association> {
        self.association
            .as_mut()
            .ok_or_else(|| DimseError::operation_failed("association already released"))
    }
}

impl Session for DimseSession {
    fn echo(&mut self) -> dimse::Result<u16> {
        self.association()?.echo()
    }

    fn find(&mut self, query: &FindQuery) -> dimse::Result<Responses<'_>> {
        let stream = self.association()?.find(query)?;
        Ok(Box::new(stream))
    }

    fn move_request(&mut self, query: &MoveQuery) -> dimse::Result<Responses<'_>> {
        let stream = self.association()?.move_request(query)?;
        Ok(Box::new(stream))
    }

    fn release(&mut self) -> dimse::Result<()> {
        match self.association.take() {
            Some(association) => association.release(),
            None => Ok(()),
        }
    }
}

/// An open session released exactly once when dropped.
///
/// Release failures are logged and never replace an error already
/// propagating from the scope.
pub struct AssociationSession<S: Session> {
    session: S,
    remote: String,
}

impl<S: Session> AssociationSession<S> {
    /// Open a session, classifying establishment failures
    pub fn open<C>(connector: &C, command: DimseCommand) -> Result<Self>
    where
        C: Connector<Session = S>,
    {
        let remote = connector.remote();
        debug!("Opening {} session with {}", command, remote);
        let session = connector
            .open(command)
            .map_err(|e| PacsError::connection(remote.clone(), e))?;
        Ok(Self { session, remote })
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }
}

impl<S: Session> Deref for AssociationSession<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.session
    }
}

impl<S: Session> DerefMut for AssociationSession<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.session
    }
}

impl<S: Session> Drop for AssociationSession<S> {
    fn drop(&mut self) {
        match self.session.release() {
            Ok(()) => debug!("Released session with {}", self.remote),
            Err(e) => warn!("Failed to release session with {}: {}", self.remote, e),
        }
    }
}

/// Run `f` inside a freshly opened session
pub fn with_session<C, T, F>(connector: &C, command: DimseCommand, f: F) -> Result<T>
where
    C: Connector,
    F: FnOnce(&mut AssociationSession<C::Session>) -> Result<T>,
{
    let mut session = AssociationSession::open(connector, command)?;
    f(&mut session)
}
