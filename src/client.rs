//! Blocking client. One connection per call, matching the server's
//! one-request-per-connection discipline.
//!
//! Every call runs the full connect / send / receive cycle; an
//! `EVMGRNACT` return code (server draining or worker pool exhausted)
//! retries the whole cycle under the configured [`RetryPolicy`]. The
//! historical behaviour of retrying forever is the default policy.

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::protocol::{
    codes, limits, read_reply, write_request, RepType, ReqType, LIST_BEGIN, LIST_CONTINUE,
    LIST_END, VMGR_MAGIC2,
};
use crate::retry::RetryPolicy;
use crate::types::{
    Allocation, DensityMapping, DeviceGroupMapping, TapeLibrary, TapeModel, TapePool,
};
use crate::wire::{WireReader, WireWriter};
use log::{info, warn};
use std::io::Write;
use std::net::TcpStream;
use std::thread;

/// Everything `QUERY_TAPE` reports about one volume side.
#[derive(Debug, Clone, Default)]
pub struct TapeInfo {
    pub vsn: String,
    pub library: String,
    pub density: String,
    pub lbltype: String,
    pub model: String,
    pub media_letter: String,
    pub manufacturer: String,
    pub sn: String,
    pub nbsides: u16,
    pub etime: i64,
    pub side: u16,
    pub poolname: String,
    pub estimated_free_space: u64,
    pub nbfiles: i32,
    pub rcount: i32,
    pub wcount: i32,
    pub rhost: String,
    pub whost: String,
    pub rjid: i32,
    pub wjid: i32,
    pub rtime: i64,
    pub wtime: i64,
    pub status: i32,
}

/// One row of a `LIST_TAPE` exchange: the volume identity plus one side.
#[derive(Debug, Clone, Default)]
pub struct TapeListEntry {
    pub vid: String,
    pub vsn: String,
    pub library: String,
    pub density: String,
    pub lbltype: String,
    pub model: String,
    pub media_letter: String,
    pub manufacturer: String,
    pub sn: String,
    pub nbsides: u16,
    pub etime: i64,
    pub side: u16,
    pub poolname: String,
    pub estimated_free_space: u64,
    pub nbfiles: i32,
    pub status: i32,
}

/// Volume fields for `ENTER_TAPE`; optional fields left empty take the
/// server-side defaults (VSN = VID, label type `al`, pool `default`).
#[derive(Debug, Clone, Default)]
pub struct EnterTapeRequest {
    pub vid: String,
    pub vsn: String,
    pub library: String,
    pub density: String,
    pub lbltype: String,
    pub model: String,
    pub media_letter: String,
    pub manufacturer: String,
    pub sn: String,
    pub nbsides: u16,
    pub poolname: String,
    pub side_status: i32,
}

/// Mutation set for `MODIFY_TAPE`; empty strings and a negative status
/// leave the corresponding field unchanged.
#[derive(Debug, Clone)]
pub struct ModifyTapeRequest {
    pub vid: String,
    pub vsn: String,
    pub library: String,
    pub density: String,
    pub lbltype: String,
    pub manufacturer: String,
    pub sn: String,
    pub poolname: String,
    pub status: i32,
}

impl Default for ModifyTapeRequest {
    fn default() -> Self {
        Self {
            vid: String::new(),
            vsn: String::new(),
            library: String::new(),
            density: String::new(),
            lbltype: String::new(),
            manufacturer: String::new(),
            sn: String::new(),
            poolname: String::new(),
            status: -1,
        }
    }
}

pub struct VmgrClient {
    config: ClientConfig,
    retry: RetryPolicy,
    uid: u32,
    gid: u32,
}

impl VmgrClient {
    pub fn new(config: ClientConfig) -> Self {
        let retry = match config.max_retries {
            Some(max) => RetryPolicy::bounded(max, config.retry_interval()),
            None => RetryPolicy::unbounded(config.retry_interval()),
        };
        Self {
            config,
            retry,
            uid: 0,
            gid: 0,
        }
    }

    /// Credentials sent with every request.
    pub fn with_identity(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn body(&self) -> WireWriter {
        let mut w = WireWriter::new();
        w.put_u32(self.uid);
        w.put_u32(self.gid);
        w
    }

    fn connect(&self) -> Result<TcpStream, ClientError> {
        let addr = (self.config.host.as_str(), self.config.port);
        Ok(TcpStream::connect(addr)?)
    }

    /// One complete request: connect, send, drain the reply sequence.
    /// Returns the `MSG_DATA` payload if the server sent one.
    fn attempt(&self, req_type: ReqType, body: &[u8]) -> Result<Option<Vec<u8>>, ClientError> {
        let mut stream = self.connect()?;
        write_request(&mut stream, VMGR_MAGIC2, req_type, body)?;
        read_final(&mut stream)
    }

    /// Request with the not-active retry loop around the whole cycle.
    fn call(&self, req_type: ReqType, body: &[u8]) -> Result<Option<Vec<u8>>, ClientError> {
        let mut handle = self.retry.handle();
        loop {
            match self.attempt(req_type, body) {
                Err(err) if err.remote_code() == Some(codes::EVMGRNACT) => {
                    match handle.next_delay() {
                        Some(delay) => {
                            warn!(
                                "event=server_not_active op={} retry_in_ms={}",
                                req_type.name(),
                                delay.as_millis()
                            );
                            thread::sleep(delay);
                        }
                        None => {
                            return Err(ClientError::RetriesExhausted {
                                attempts: handle.attempts() + 1,
                            })
                        }
                    }
                }
                other => return other,
            }
        }
    }

    fn expect_data(&self, req_type: ReqType, body: &[u8]) -> Result<Vec<u8>, ClientError> {
        self.call(req_type, body)?
            .ok_or_else(|| ClientError::Protocol("missing data reply".into()))
    }

    /// Low-level call that copies the `MSG_DATA` payload into `buf`.
    /// Returns the copied length and whether the payload was truncated to
    /// fit.
    pub fn call_raw(
        &self,
        req_type: ReqType,
        body: &[u8],
        buf: &mut [u8],
    ) -> Result<(usize, bool), ClientError> {
        let payload = self.call(req_type, body)?.unwrap_or_default();
        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        Ok((n, payload.len() > buf.len()))
    }

    // --- volumes ---

    pub fn enter_tape(&self, req: &EnterTapeRequest) -> Result<(), ClientError> {
        let mut w = self.body();
        w.put_string(&req.vid);
        w.put_string(&req.vsn);
        w.put_string(&req.library);
        w.put_string(&req.density);
        w.put_string(&req.lbltype);
        w.put_string(&req.model);
        w.put_string(&req.media_letter);
        w.put_string(&req.manufacturer);
        w.put_string(&req.sn);
        w.put_u16(req.nbsides.max(1));
        w.put_string(&req.poolname);
        w.put_i32(req.side_status);
        self.call(ReqType::EnterTape, w.as_slice())?;
        Ok(())
    }

    pub fn modify_tape(&self, req: &ModifyTapeRequest) -> Result<(), ClientError> {
        let mut w = self.body();
        w.put_string(&req.vid);
        w.put_string(&req.vsn);
        w.put_string(&req.library);
        w.put_string(&req.density);
        w.put_string(&req.lbltype);
        w.put_string(&req.manufacturer);
        w.put_string(&req.sn);
        w.put_string(&req.poolname);
        w.put_i32(req.status);
        self.call(ReqType::ModifyTape, w.as_slice())?;
        Ok(())
    }

    pub fn delete_tape(&self, vid: &str) -> Result<(), ClientError> {
        let mut w = self.body();
        w.put_string(vid);
        self.call(ReqType::DeleteTape, w.as_slice())?;
        Ok(())
    }

    pub fn query_tape(&self, vid: &str, side: u16) -> Result<TapeInfo, ClientError> {
        let mut w = self.body();
        w.put_string(vid);
        w.put_u16(side);
        let payload = self.expect_data(ReqType::QueryTape, w.as_slice())?;
        let mut r = WireReader::new(&payload);
        Ok(TapeInfo {
            vsn: r.get_string(limits::VSN)?,
            library: r.get_string(limits::LIBRARY)?,
            density: r.get_string(limits::DENSITY)?,
            lbltype: r.get_string(limits::LBLTYPE)?,
            model: r.get_string(limits::MODEL)?,
            media_letter: r.get_string(limits::MEDIA_LETTER)?,
            manufacturer: r.get_string(limits::MANUFACTURER)?,
            sn: r.get_string(limits::SERIAL)?,
            nbsides: r.get_u16()?,
            etime: r.get_i64()?,
            side: r.get_u16()?,
            poolname: r.get_string(limits::POOL_NAME)?,
            estimated_free_space: r.get_u64()?,
            nbfiles: r.get_i32()?,
            rcount: r.get_i32()?,
            wcount: r.get_i32()?,
            rhost: r.get_string(limits::HOST)?,
            whost: r.get_string(limits::HOST)?,
            rjid: r.get_i32()?,
            wjid: r.get_i32()?,
            rtime: r.get_i64()?,
            wtime: r.get_i64()?,
            status: r.get_i32()?,
        })
    }

    // --- models ---

    pub fn enter_model(&self, model: &TapeModel) -> Result<(), ClientError> {
        let mut w = self.body();
        w.put_string(&model.model);
        w.put_string(&model.media_letter);
        w.put_i32(model.media_cost);
        self.call(ReqType::EnterModel, w.as_slice())?;
        Ok(())
    }

    /// Empty media letter / negative cost leave the field unchanged.
    pub fn modify_model(
        &self,
        model: &str,
        media_letter: &str,
        media_cost: i32,
    ) -> Result<(), ClientError> {
        let mut w = self.body();
        w.put_string(model);
        w.put_string(media_letter);
        w.put_i32(media_cost);
        self.call(ReqType::ModifyModel, w.as_slice())?;
        Ok(())
    }

    pub fn delete_model(&self, model: &str) -> Result<(), ClientError> {
        let mut w = self.body();
        w.put_string(model);
        self.call(ReqType::DeleteModel, w.as_slice())?;
        Ok(())
    }

    pub fn query_model(&self, model: &str) -> Result<TapeModel, ClientError> {
        let mut w = self.body();
        w.put_string(model);
        let payload = self.expect_data(ReqType::QueryModel, w.as_slice())?;
        let mut r = WireReader::new(&payload);
        Ok(TapeModel {
            model: model.to_string(),
            media_letter: r.get_string(limits::MEDIA_LETTER)?,
            media_cost: r.get_i32()?,
        })
    }

    // --- pools ---

    pub fn enter_pool(&self, name: &str, uid: u32, gid: u32) -> Result<(), ClientError> {
        let mut w = self.body();
        w.put_string(name);
        w.put_u32(uid);
        w.put_u32(gid);
        self.call(ReqType::EnterPool, w.as_slice())?;
        Ok(())
    }

    /// Negative uid/gid leave the owner unchanged.
    pub fn modify_pool(&self, name: &str, uid: i32, gid: i32) -> Result<(), ClientError> {
        let mut w = self.body();
        w.put_string(name);
        w.put_i32(uid);
        w.put_i32(gid);
        self.call(ReqType::ModifyPool, w.as_slice())?;
        Ok(())
    }

    pub fn delete_pool(&self, name: &str) -> Result<(), ClientError> {
        let mut w = self.body();
        w.put_string(name);
        self.call(ReqType::DeletePool, w.as_slice())?;
        Ok(())
    }

    pub fn query_pool(&self, name: &str) -> Result<TapePool, ClientError> {
        let mut w = self.body();
        w.put_string(name);
        let payload = self.expect_data(ReqType::QueryPool, w.as_slice())?;
        let mut r = WireReader::new(&payload);
        Ok(TapePool {
            name: name.to_string(),
            uid: r.get_u32()?,
            gid: r.get_u32()?,
            capacity: r.get_u64()?,
            tot_free_space: r.get_u64()?,
        })
    }

    // --- libraries ---

    pub fn enter_library(&self, name: &str, capacity: i32, status: i32) -> Result<(), ClientError> {
        let mut w = self.body();
        w.put_string(name);
        w.put_i32(capacity);
        w.put_i32(status);
        self.call(ReqType::EnterLibrary, w.as_slice())?;
        Ok(())
    }

    /// Negative capacity/status leave the field unchanged.
    pub fn modify_library(
        &self,
        name: &str,
        capacity: i32,
        status: i32,
    ) -> Result<(), ClientError> {
        let mut w = self.body();
        w.put_string(name);
        w.put_i32(capacity);
        w.put_i32(status);
        self.call(ReqType::ModifyLibrary, w.as_slice())?;
        Ok(())
    }

    pub fn delete_library(&self, name: &str) -> Result<(), ClientError> {
        let mut w = self.body();
        w.put_string(name);
        self.call(ReqType::DeleteLibrary, w.as_slice())?;
        Ok(())
    }

    pub fn query_library(&self, name: &str) -> Result<TapeLibrary, ClientError> {
        let mut w = self.body();
        w.put_string(name);
        let payload = self.expect_data(ReqType::QueryLibrary, w.as_slice())?;
        let mut r = WireReader::new(&payload);
        Ok(TapeLibrary {
            name: name.to_string(),
            capacity: r.get_i32()?,
            nb_free_slots: r.get_i32()?,
            status: r.get_i32()?,
        })
    }

    // --- density and device-group mappings ---

    pub fn enter_denmap(&self, denmap: &DensityMapping) -> Result<(), ClientError> {
        let mut w = self.body();
        w.put_string(&denmap.model);
        w.put_string(&denmap.media_letter);
        w.put_string(&denmap.density);
        w.put_u64(denmap.native_capacity);
        self.call(ReqType::EnterDenMap, w.as_slice())?;
        Ok(())
    }

    pub fn delete_denmap(
        &self,
        model: &str,
        media_letter: &str,
        density: &str,
    ) -> Result<(), ClientError> {
        let mut w = self.body();
        w.put_string(model);
        w.put_string(media_letter);
        w.put_string(density);
        self.call(ReqType::DeleteDenMap, w.as_slice())?;
        Ok(())
    }

    pub fn enter_dgnmap(&self, dgn: &str, model: &str, library: &str) -> Result<(), ClientError> {
        let mut w = self.body();
        w.put_string(dgn);
        w.put_string(model);
        w.put_string(library);
        self.call(ReqType::EnterDgnMap, w.as_slice())?;
        Ok(())
    }

    pub fn delete_dgnmap(&self, model: &str, library: &str) -> Result<(), ClientError> {
        let mut w = self.body();
        w.put_string(model);
        w.put_string(library);
        self.call(ReqType::DeleteDgnMap, w.as_slice())?;
        Ok(())
    }

    // --- allocation and accounting ---

    /// Asks for a side of `pool` able to hold `size` bytes.
    pub fn get_tape(&self, pool: &str, size: u64) -> Result<Allocation, ClientError> {
        let mut w = self.body();
        w.put_string(pool);
        w.put_u64(size);
        w.put_string("");
        let payload = self.expect_data(ReqType::GetTape, w.as_slice())?;
        let mut r = WireReader::new(&payload);
        let allocation = Allocation {
            vid: r.get_string(limits::VID)?,
            vsn: r.get_string(limits::VSN)?,
            dgn: r.get_string(limits::DGN)?,
            density: r.get_string(limits::DENSITY)?,
            lbltype: r.get_string(limits::LBLTYPE)?,
            model: r.get_string(limits::MODEL)?,
            side: r.get_u16()?,
            fseq: r.get_i32()?,
            estimated_free_space: r.get_u64()?,
        };
        info!(
            "event=tape_allocated vid={} side={} fseq={}",
            allocation.vid, allocation.side, allocation.fseq
        );
        Ok(allocation)
    }

    pub fn update_tape(
        &self,
        vid: &str,
        side: u16,
        bytes_written: u64,
        compression_factor: u16,
        files_written: u16,
        flags: i32,
    ) -> Result<(), ClientError> {
        let mut w = self.body();
        w.put_string(vid);
        w.put_u16(side);
        w.put_u64(bytes_written);
        w.put_u16(compression_factor);
        w.put_u16(files_written);
        w.put_i32(flags);
        self.call(ReqType::UpdateTape, w.as_slice())?;
        Ok(())
    }

    pub fn reclaim(&self, vid: &str) -> Result<(), ClientError> {
        let mut w = self.body();
        w.put_string(vid);
        self.call(ReqType::Reclaim, w.as_slice())?;
        Ok(())
    }

    // --- tags ---

    pub fn set_tag(&self, vid: &str, text: &str) -> Result<(), ClientError> {
        let mut w = self.body();
        w.put_string(vid);
        w.put_string(text);
        self.call(ReqType::SetTag, w.as_slice())?;
        Ok(())
    }

    pub fn get_tag(&self, vid: &str) -> Result<String, ClientError> {
        let mut w = self.body();
        w.put_string(vid);
        let payload = self.expect_data(ReqType::GetTag, w.as_slice())?;
        let mut r = WireReader::new(&payload);
        Ok(r.get_string(limits::TAG)?)
    }

    pub fn del_tag(&self, vid: &str) -> Result<(), ClientError> {
        let mut w = self.body();
        w.put_string(vid);
        self.call(ReqType::DelTag, w.as_slice())?;
        Ok(())
    }

    // --- mount notification and shutdown ---

    pub fn tpmounted(&self, vid: &str, write_mode: bool, jid: i32) -> Result<(), ClientError> {
        let mut w = self.body();
        w.put_string(vid);
        w.put_u16(u16::from(write_mode));
        w.put_i32(jid);
        self.call(ReqType::TpMounted, w.as_slice())?;
        Ok(())
    }

    pub fn shutdown(&self) -> Result<(), ClientError> {
        let w = self.body();
        self.call(ReqType::Shutdown, w.as_slice())?;
        Ok(())
    }

    // --- lists ---

    pub fn list_tapes(&self) -> Result<Vec<TapeListEntry>, ClientError> {
        self.list(ReqType::ListTape, |r| {
            Ok(TapeListEntry {
                vid: r.get_string(limits::VID)?,
                vsn: r.get_string(limits::VSN)?,
                library: r.get_string(limits::LIBRARY)?,
                density: r.get_string(limits::DENSITY)?,
                lbltype: r.get_string(limits::LBLTYPE)?,
                model: r.get_string(limits::MODEL)?,
                media_letter: r.get_string(limits::MEDIA_LETTER)?,
                manufacturer: r.get_string(limits::MANUFACTURER)?,
                sn: r.get_string(limits::SERIAL)?,
                nbsides: r.get_u16()?,
                etime: r.get_i64()?,
                side: r.get_u16()?,
                poolname: r.get_string(limits::POOL_NAME)?,
                estimated_free_space: r.get_u64()?,
                nbfiles: r.get_i32()?,
                status: r.get_i32()?,
            })
        })
    }

    pub fn list_pools(&self) -> Result<Vec<TapePool>, ClientError> {
        self.list(ReqType::ListPool, |r| {
            Ok(TapePool {
                name: r.get_string(limits::POOL_NAME)?,
                uid: r.get_u32()?,
                gid: r.get_u32()?,
                capacity: r.get_u64()?,
                tot_free_space: r.get_u64()?,
            })
        })
    }

    pub fn list_libraries(&self) -> Result<Vec<TapeLibrary>, ClientError> {
        self.list(ReqType::ListLibrary, |r| {
            Ok(TapeLibrary {
                name: r.get_string(limits::LIBRARY)?,
                capacity: r.get_i32()?,
                nb_free_slots: r.get_i32()?,
                status: r.get_i32()?,
            })
        })
    }

    pub fn list_models(&self) -> Result<Vec<TapeModel>, ClientError> {
        self.list(ReqType::ListModel, |r| {
            Ok(TapeModel {
                model: r.get_string(limits::MODEL)?,
                media_letter: r.get_string(limits::MEDIA_LETTER)?,
                media_cost: r.get_i32()?,
            })
        })
    }

    pub fn list_denmaps(&self) -> Result<Vec<DensityMapping>, ClientError> {
        self.list(ReqType::ListDenMap, |r| {
            Ok(DensityMapping {
                model: r.get_string(limits::MODEL)?,
                media_letter: r.get_string(limits::MEDIA_LETTER)?,
                density: r.get_string(limits::DENSITY)?,
                native_capacity: r.get_u64()?,
            })
        })
    }

    pub fn list_dgnmaps(&self) -> Result<Vec<DeviceGroupMapping>, ClientError> {
        self.list(ReqType::ListDgnMap, |r| {
            Ok(DeviceGroupMapping {
                dgn: r.get_string(limits::DGN)?,
                model: r.get_string(limits::MODEL)?,
                library: r.get_string(limits::LIBRARY)?,
            })
        })
    }

    /// Drives the multi-round list exchange over one connection: send
    /// `LIST_BEGIN`, decode each batch, answer intermediate return codes
    /// with `LIST_CONTINUE` until the end-of-list marker.
    fn list<T>(
        &self,
        req_type: ReqType,
        mut decode: impl FnMut(&mut WireReader<'_>) -> Result<T, ClientError>,
    ) -> Result<Vec<T>, ClientError> {
        let mut handle = self.retry.handle();
        let mut stream = loop {
            let mut stream = self.connect()?;
            let mut w = self.body();
            w.put_u16(LIST_BEGIN);
            write_request(&mut stream, VMGR_MAGIC2, req_type, w.as_slice())?;
            // Worker exhaustion is answered with a bare RC before any data.
            match peek_first_reply(&mut stream)? {
                FirstReply::NotActive => match handle.next_delay() {
                    Some(delay) => thread::sleep(delay),
                    None => {
                        return Err(ClientError::RetriesExhausted {
                            attempts: handle.attempts() + 1,
                        })
                    }
                },
                FirstReply::Data(payload) => break (stream, payload),
            }
        };

        let mut entries = Vec::new();
        let mut payload = stream.1;
        loop {
            let mut r = WireReader::new(&payload);
            let nbentries = r.get_u16()?;
            for _ in 0..nbentries {
                entries.push(decode(&mut r)?);
            }
            let eol = r.get_u16()? == 1;

            // Every batch is acknowledged with an intermediate return code.
            let reply = read_reply(&mut stream.0)?;
            let code = decode_rc(&reply.payload)?;
            if code != 0 {
                return Err(ClientError::Remote {
                    code,
                    message: None,
                });
            }
            if reply.rep_type != RepType::Irc {
                return Err(ClientError::Protocol(format!(
                    "unexpected {:?} after list batch",
                    reply.rep_type
                )));
            }

            if eol {
                // Close the server-side cursor and collect the final code.
                let mut w = self.body();
                w.put_u16(LIST_END);
                write_request(&mut stream.0, VMGR_MAGIC2, req_type, w.as_slice())?;
                let reply = read_reply(&mut stream.0)?;
                let code = decode_rc(&reply.payload)?;
                if reply.rep_type != RepType::Rc || code != 0 {
                    return Err(ClientError::Remote {
                        code,
                        message: None,
                    });
                }
                return Ok(entries);
            }

            let mut w = self.body();
            w.put_u16(LIST_CONTINUE);
            write_request(&mut stream.0, VMGR_MAGIC2, req_type, w.as_slice())?;
            payload = match read_reply(&mut stream.0)? {
                reply if reply.rep_type == RepType::MsgData => reply.payload,
                reply => {
                    return Err(ClientError::Protocol(format!(
                        "unexpected {:?} inside list",
                        reply.rep_type
                    )))
                }
            };
        }
    }
}

enum FirstReply {
    Data(Vec<u8>),
    NotActive,
}

fn peek_first_reply(stream: &mut TcpStream) -> Result<FirstReply, ClientError> {
    let reply = read_reply(stream)?;
    match reply.rep_type {
        RepType::MsgData => Ok(FirstReply::Data(reply.payload)),
        RepType::Rc => {
            let code = decode_rc(&reply.payload)?;
            if code == codes::EVMGRNACT {
                Ok(FirstReply::NotActive)
            } else {
                Err(ClientError::Remote {
                    code,
                    message: None,
                })
            }
        }
        other => Err(ClientError::Protocol(format!(
            "unexpected {other:?} opening a list"
        ))),
    }
}

fn decode_rc(payload: &[u8]) -> Result<i32, ClientError> {
    let mut r = WireReader::new(payload);
    Ok(r.get_i32()?)
}

/// Reads reply messages until the final return code. `MSG_ERR` text is
/// remembered and attached to a non-zero return code.
fn read_final(stream: &mut (impl std::io::Read + Write)) -> Result<Option<Vec<u8>>, ClientError> {
    let mut data = None;
    let mut last_error = None;
    loop {
        let reply = read_reply(stream)?;
        match reply.rep_type {
            RepType::MsgErr => {
                let mut r = WireReader::new(&reply.payload);
                last_error = Some(r.get_string(reply.payload.len().max(1))?);
            }
            RepType::MsgData => data = Some(reply.payload),
            RepType::Irc => {}
            RepType::Rc => {
                let code = decode_rc(&reply.payload)?;
                if code == 0 {
                    return Ok(data);
                }
                return Err(ClientError::Remote {
                    code,
                    message: last_error,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{write_rc, write_reply, VMGR_MAGIC};

    #[test]
    fn reply_sequence_collects_data_and_final_code() {
        let mut wire = Vec::new();
        write_reply(&mut wire, VMGR_MAGIC, RepType::MsgData, b"abc\0").unwrap();
        write_rc(&mut wire, VMGR_MAGIC, 0).unwrap();
        let mut cursor = std::io::Cursor::new(wire);
        let data = read_final(&mut cursor).unwrap();
        assert_eq!(data.as_deref(), Some(&b"abc\0"[..]));
    }

    #[test]
    fn error_text_is_attached_to_the_final_code() {
        let mut wire = Vec::new();
        crate::protocol::write_err_text(&mut wire, VMGR_MAGIC, "No such pool").unwrap();
        write_rc(&mut wire, VMGR_MAGIC, codes::EINVAL).unwrap();
        let mut cursor = std::io::Cursor::new(wire);
        let err = read_final(&mut cursor).unwrap_err();
        match err {
            ClientError::Remote { code, message } => {
                assert_eq!(code, codes::EINVAL);
                assert_eq!(message.as_deref(), Some("No such pool"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
