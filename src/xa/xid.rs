use std::fmt;
use bytes::{Buf, BufMut};
use crate::core::error::{Error, ErrorKind, Result};

/// Maximum length of the global and branch qualifiers, as in X/Open XA.
pub const MAX_QUALIFIER_LEN: usize = 64;

/// Global transaction branch identifier handed out by the coordinator.
///
/// Built only through `new` or `local`, so both qualifiers fit the one-byte
/// length prefixes of the log encoding.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Xid {
    format_id: i32,
    global_id: Vec<u8>,
    branch_id: Vec<u8>,
}

impl Xid {
    pub fn new(format_id: i32, global_id: impl Into<Vec<u8>>, branch_id: impl Into<Vec<u8>>) -> Result<Self> {
        let xid = Xid {
            format_id,
            global_id: global_id.into(),
            branch_id: branch_id.into(),
        };
        if xid.global_id.len() > MAX_QUALIFIER_LEN || xid.branch_id.len() > MAX_QUALIFIER_LEN {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("xid qualifiers are limited to {} bytes", MAX_QUALIFIER_LEN),
            ));
        }
        Ok(xid)
    }

    /// A branch id for transactions the index starts on its own behalf.
    pub fn local(sequence: u64) -> Self {
        Xid {
            format_id: 0,
            global_id: sequence.to_be_bytes().to_vec(),
            branch_id: b"txindex".to_vec(),
        }
    }

    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    pub fn global_id(&self) -> &[u8] {
        &self.global_id
    }

    pub fn branch_id(&self) -> &[u8] {
        &self.branch_id
    }

    pub fn encoded_len(&self) -> usize {
        4 + 1 + self.global_id.len() + 1 + self.branch_id.len()
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32(self.format_id);
        buf.put_u8(self.global_id.len() as u8);
        buf.put_slice(&self.global_id);
        buf.put_u8(self.branch_id.len() as u8);
        buf.put_slice(&self.branch_id);
    }

    /// Decodes an xid from the front of `bytes`; `None` if the bytes run out.
    pub fn decode(bytes: &[u8]) -> Result<Option<(Xid, usize)>> {
        let mut cur = bytes;
        if cur.remaining() < 5 {
            return Ok(None);
        }
        let format_id = cur.get_i32();
        let global_len = cur.get_u8() as usize;
        if global_len > MAX_QUALIFIER_LEN {
            return Err(Error::corrupt(format!("xid global id of {} bytes", global_len)));
        }
        if cur.remaining() < global_len + 1 {
            return Ok(None);
        }
        let global_id = cur.copy_to_bytes(global_len).to_vec();
        let branch_len = cur.get_u8() as usize;
        if branch_len > MAX_QUALIFIER_LEN {
            return Err(Error::corrupt(format!("xid branch id of {} bytes", branch_len)));
        }
        if cur.remaining() < branch_len {
            return Ok(None);
        }
        let branch_id = cur.copy_to_bytes(branch_len).to_vec();

        let used = bytes.len() - cur.remaining();
        Ok(Some((Xid { format_id, global_id, branch_id }, used)))
    }
}

impl fmt::Debug for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Xid({}:", self.format_id)?;
        for b in &self.global_id {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ":")?;
        for b in &self.branch_id {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}
