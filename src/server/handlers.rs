//! Request decoding, authorization and per-operation logic.
//!
//! Every request body opens with the caller credentials (`u32 uid`,
//! `u32 gid`) followed by the operation fields: NUL-terminated strings and
//! big-endian integers in a fixed order. Generation 1 frames carry sizes as
//! `u32` kilobytes and know nothing about sides or the extended identity
//! fields; generation 2 carries byte-accurate `u64` sizes and `u16` side
//! indices. Replies always use the request's generation.

use crate::alloc::{self, EnterVolume, ModifyVolume, WriteAccounting};
use crate::error::HandlerError;
use crate::privilege::{Privilege, PrivilegeChecker};
use crate::protocol::{
    codes, limits, ReqType, RequestFrame, LISTBUFSZ, LIST_BEGIN, LIST_CONTINUE, LIST_END,
    VMGR_MAGIC2,
};
use crate::store::{Transaction, VolumeStore};
use crate::types::{
    DensityMapping, DeviceGroupMapping, DeviceGroupWeight, TapeLibrary, TapeModel, TapePool,
};
use crate::wire::{WireReader, WireWriter};
use log::{info, warn};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Connection-scoped request metadata.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub client_host: String,
    pub magic: u32,
}

impl RequestContext {
    fn gen2(&self) -> bool {
        self.magic == VMGR_MAGIC2
    }
}

/// What the connection loop must send back.
#[derive(Debug)]
pub enum Reply {
    /// `VMGR_RC(0)`, nothing else.
    Ok,
    /// One `MSG_DATA` payload followed by `VMGR_RC(0)`.
    Data(Vec<u8>),
    /// Acknowledge with `VMGR_RC(0)` and begin draining the server.
    Shutdown,
    /// Enter the multi-round list exchange with this cursor.
    List(ListCursor),
}

/// Server-side cursor of an in-progress list: the matching entries are
/// encoded once at `LIST_BEGIN` and then streamed out in batches sized to
/// the reply buffer.
#[derive(Debug)]
pub struct ListCursor {
    entries: Vec<Vec<u8>>,
    pos: usize,
    per_batch: usize,
}

impl ListCursor {
    fn new(entries: Vec<Vec<u8>>, entry_max: usize) -> Self {
        Self {
            entries,
            pos: 0,
            per_batch: (LISTBUFSZ / entry_max).max(1),
        }
    }

    /// Encodes the next batch: `u16 nbentries | entries | u16 eol`.
    /// `eol` is 1 on the batch that exhausts the cursor.
    pub fn next_batch(&mut self) -> (Vec<u8>, bool) {
        let end = (self.pos + self.per_batch).min(self.entries.len());
        let batch = &self.entries[self.pos..end];
        let eol = end == self.entries.len();
        let mut out = WireWriter::with_capacity(LISTBUFSZ);
        out.put_u16(batch.len() as u16);
        for entry in batch {
            out.put_bytes(entry);
        }
        out.put_u16(u16::from(eol));
        self.pos = end;
        (out.into_bytes(), eol)
    }
}

/// Stateless dispatch over the store and the privilege table; shared by all
/// worker threads.
pub struct HandlerSet {
    store: Arc<VolumeStore>,
    privileges: Arc<dyn PrivilegeChecker>,
}

impl HandlerSet {
    pub fn new(store: Arc<VolumeStore>, privileges: Arc<dyn PrivilegeChecker>) -> Self {
        Self { store, privileges }
    }

    pub fn store(&self) -> &Arc<VolumeStore> {
        &self.store
    }

    /// Decodes and executes one request. List requests yield a cursor for
    /// the connection loop to drive; everything else completes here, inside
    /// one transaction.
    pub fn handle(&self, ctx: &RequestContext, frame: &RequestFrame) -> Result<Reply, HandlerError> {
        let mut r = WireReader::new(&frame.body);
        let uid = r.get_u32()?;
        let gid = r.get_u32()?;
        info!(
            "event=request op={} uid={} gid={} host={}",
            frame.req_type.name(),
            uid,
            gid,
            ctx.client_host
        );

        if frame.req_type.is_list() {
            // The flag is validated by the connection loop; the body of
            // every round carries it after the credentials.
            let flag = r.get_u16()?;
            if flag != LIST_BEGIN && flag != LIST_CONTINUE && flag != LIST_END {
                return Err(HandlerError::code(codes::EINVAL));
            }
            return Ok(Reply::List(self.begin_list(ctx, frame.req_type)?));
        }

        match frame.req_type {
            ReqType::EnterTape => self.enter_tape(ctx, uid, gid, &mut r),
            ReqType::ModifyTape => self.modify_tape(ctx, uid, gid, &mut r),
            ReqType::DeleteTape => self.delete_tape(ctx, uid, gid, &mut r),
            ReqType::QueryTape => self.query_tape(ctx, &mut r),
            ReqType::EnterModel => self.enter_model(ctx, uid, gid, &mut r),
            ReqType::ModifyModel => self.modify_model(ctx, uid, gid, &mut r),
            ReqType::DeleteModel => self.delete_model(ctx, uid, gid, &mut r),
            ReqType::QueryModel => self.query_model(&mut r),
            ReqType::EnterPool => self.enter_pool(ctx, uid, gid, &mut r),
            ReqType::ModifyPool => self.modify_pool(ctx, uid, gid, &mut r),
            ReqType::DeletePool => self.delete_pool(ctx, uid, gid, &mut r),
            ReqType::QueryPool => self.query_pool(ctx, &mut r),
            ReqType::EnterLibrary => self.enter_library(ctx, uid, gid, &mut r),
            ReqType::ModifyLibrary => self.modify_library(ctx, uid, gid, &mut r),
            ReqType::DeleteLibrary => self.delete_library(ctx, uid, gid, &mut r),
            ReqType::QueryLibrary => self.query_library(&mut r),
            ReqType::EnterDenMap => self.enter_denmap(ctx, uid, gid, &mut r),
            ReqType::DeleteDenMap => self.delete_denmap(ctx, uid, gid, &mut r),
            ReqType::EnterDgnMap => self.enter_dgnmap(ctx, uid, gid, &mut r),
            ReqType::DeleteDgnMap => self.delete_dgnmap(ctx, uid, gid, &mut r),
            ReqType::GetTape => self.get_tape(ctx, uid, gid, &mut r),
            ReqType::UpdateTape => self.update_tape(ctx, &mut r),
            ReqType::SetTag => self.set_tag(ctx, uid, gid, &mut r),
            ReqType::GetTag => self.get_tag(&mut r),
            ReqType::DelTag => self.del_tag(ctx, uid, gid, &mut r),
            ReqType::Reclaim => self.reclaim(ctx, uid, gid, &mut r),
            ReqType::TpMounted => self.tpmounted(ctx, uid, gid, &mut r),
            ReqType::Shutdown => self.shutdown(ctx, uid, gid),
            _ => Err(HandlerError::code(codes::EINVAL)),
        }
    }

    fn require(
        &self,
        ctx: &RequestContext,
        uid: u32,
        gid: u32,
        privilege: Privilege,
    ) -> Result<(), HandlerError> {
        if self.privileges.check(uid, gid, &ctx.client_host, privilege) {
            Ok(())
        } else {
            warn!(
                "event=access_denied uid={} gid={} host={} needed={:?}",
                uid, gid, ctx.client_host, privilege
            );
            Err(HandlerError::code(codes::EACCES))
        }
    }

    // --- volumes ---

    fn enter_tape(
        &self,
        ctx: &RequestContext,
        uid: u32,
        gid: u32,
        r: &mut WireReader<'_>,
    ) -> Result<Reply, HandlerError> {
        self.require(ctx, uid, gid, Privilege::TapeOperator)?;
        let mut req = EnterVolume {
            vid: r.get_string(limits::VID)?,
            vsn: r.get_string(limits::VSN)?,
            library: r.get_string(limits::LIBRARY)?,
            density: r.get_string(limits::DENSITY)?,
            lbltype: r.get_string(limits::LBLTYPE)?,
            model: r.get_string(limits::MODEL)?,
            media_letter: r.get_string(limits::MEDIA_LETTER)?,
            manufacturer: r.get_string(limits::MANUFACTURER)?,
            sn: r.get_string(limits::SERIAL)?,
            nbsides: 1,
            ..Default::default()
        };
        if ctx.gen2() {
            req.nbsides = r.get_u16()?;
        }
        req.poolname = r.get_string(limits::POOL_NAME)?;
        req.side_status = r.get_i32()?;
        if req.vid.is_empty() {
            return Err(HandlerError::code(codes::EINVAL));
        }
        let mut tx = self.store.begin();
        alloc::enter_volume(&mut tx, req, now())?;
        tx.commit()?;
        Ok(Reply::Ok)
    }

    fn modify_tape(
        &self,
        ctx: &RequestContext,
        uid: u32,
        gid: u32,
        r: &mut WireReader<'_>,
    ) -> Result<Reply, HandlerError> {
        self.require(ctx, uid, gid, Privilege::TapeOperator)?;
        let req = ModifyVolume {
            vid: r.get_string(limits::VID)?,
            vsn: r.get_string(limits::VSN)?,
            library: r.get_string(limits::LIBRARY)?,
            density: r.get_string(limits::DENSITY)?,
            lbltype: r.get_string(limits::LBLTYPE)?,
            manufacturer: r.get_string(limits::MANUFACTURER)?,
            sn: r.get_string(limits::SERIAL)?,
            poolname: r.get_string(limits::POOL_NAME)?,
            status: r.get_i32()?,
        };
        let mut tx = self.store.begin();
        alloc::modify_volume(&mut tx, req)?;
        tx.commit()?;
        Ok(Reply::Ok)
    }

    fn delete_tape(
        &self,
        ctx: &RequestContext,
        uid: u32,
        gid: u32,
        r: &mut WireReader<'_>,
    ) -> Result<Reply, HandlerError> {
        self.require(ctx, uid, gid, Privilege::Admin)?;
        let vid = r.get_string(limits::VID)?;
        let mut tx = self.store.begin();
        alloc::delete_volume(&mut tx, &vid)?;
        tx.commit()?;
        Ok(Reply::Ok)
    }

    fn query_tape(
        &self,
        ctx: &RequestContext,
        r: &mut WireReader<'_>,
    ) -> Result<Reply, HandlerError> {
        let vid = r.get_string(limits::VID)?;
        let side_index = if ctx.gen2() { r.get_u16()? } else { 0 };
        let tx = self.store.begin();
        let tape = tx.get_tape(&vid)?;
        let side = tx.get_side(&vid, side_index)?;

        let mut w = WireWriter::new();
        w.put_string(&tape.vsn);
        w.put_string(&tape.library);
        w.put_string(&tape.density);
        w.put_string(&tape.lbltype);
        w.put_string(&tape.model);
        w.put_string(&tape.media_letter);
        if ctx.gen2() {
            w.put_string(&tape.manufacturer);
            w.put_string(&tape.sn);
            w.put_u16(tape.nbsides);
            w.put_i64(tape.etime);
            w.put_u16(side.side);
        }
        w.put_string(&side.poolname);
        put_size(&mut w, ctx, side.estimated_free_space);
        w.put_i32(side.nbfiles);
        w.put_i32(tape.rcount);
        w.put_i32(tape.wcount);
        if ctx.gen2() {
            w.put_string(&tape.rhost);
            w.put_string(&tape.whost);
            w.put_i32(tape.rjid);
            w.put_i32(tape.wjid);
            w.put_i64(tape.rtime);
            w.put_i64(tape.wtime);
        }
        w.put_i32(side.status);
        Ok(Reply::Data(w.into_bytes()))
    }

    // --- models ---

    fn enter_model(
        &self,
        ctx: &RequestContext,
        uid: u32,
        gid: u32,
        r: &mut WireReader<'_>,
    ) -> Result<Reply, HandlerError> {
        self.require(ctx, uid, gid, Privilege::Admin)?;
        let model = TapeModel {
            model: r.get_string(limits::MODEL)?,
            media_letter: r.get_string(limits::MEDIA_LETTER)?,
            media_cost: r.get_i32()?,
        };
        if model.model.is_empty() {
            return Err(HandlerError::code(codes::EINVAL));
        }
        let mut tx = self.store.begin();
        tx.insert_model(model)?;
        tx.commit()?;
        Ok(Reply::Ok)
    }

    fn modify_model(
        &self,
        ctx: &RequestContext,
        uid: u32,
        gid: u32,
        r: &mut WireReader<'_>,
    ) -> Result<Reply, HandlerError> {
        self.require(ctx, uid, gid, Privilege::Admin)?;
        let name = r.get_string(limits::MODEL)?;
        let media_letter = r.get_string(limits::MEDIA_LETTER)?;
        let media_cost = r.get_i32()?;
        let mut tx = self.store.begin();
        let mut model = tx.get_model(&name)?;
        if !media_letter.is_empty() {
            model.media_letter = media_letter;
        }
        if media_cost >= 0 {
            model.media_cost = media_cost;
        }
        tx.update_model(&model)?;
        tx.commit()?;
        Ok(Reply::Ok)
    }

    fn delete_model(
        &self,
        ctx: &RequestContext,
        uid: u32,
        gid: u32,
        r: &mut WireReader<'_>,
    ) -> Result<Reply, HandlerError> {
        self.require(ctx, uid, gid, Privilege::Admin)?;
        let name = r.get_string(limits::MODEL)?;
        let mut tx = self.store.begin();
        tx.delete_model(&name)?;
        tx.commit()?;
        Ok(Reply::Ok)
    }

    fn query_model(&self, r: &mut WireReader<'_>) -> Result<Reply, HandlerError> {
        let name = r.get_string(limits::MODEL)?;
        let tx = self.store.begin();
        let model = tx.get_model(&name)?;
        let mut w = WireWriter::new();
        w.put_string(&model.media_letter);
        w.put_i32(model.media_cost);
        Ok(Reply::Data(w.into_bytes()))
    }

    // --- pools ---

    fn enter_pool(
        &self,
        ctx: &RequestContext,
        uid: u32,
        gid: u32,
        r: &mut WireReader<'_>,
    ) -> Result<Reply, HandlerError> {
        self.require(ctx, uid, gid, Privilege::Admin)?;
        let pool = TapePool {
            name: r.get_string(limits::POOL_NAME)?,
            uid: r.get_u32()?,
            gid: r.get_u32()?,
            ..Default::default()
        };
        if pool.name.is_empty() {
            return Err(HandlerError::code(codes::EINVAL));
        }
        let mut tx = self.store.begin();
        tx.insert_pool(pool)?;
        tx.commit()?;
        Ok(Reply::Ok)
    }

    fn modify_pool(
        &self,
        ctx: &RequestContext,
        uid: u32,
        gid: u32,
        r: &mut WireReader<'_>,
    ) -> Result<Reply, HandlerError> {
        self.require(ctx, uid, gid, Privilege::Admin)?;
        let name = r.get_string(limits::POOL_NAME)?;
        // Negative means "leave unchanged".
        let new_uid = r.get_i32()?;
        let new_gid = r.get_i32()?;
        let mut tx = self.store.begin();
        let mut pool = tx.get_pool(&name)?;
        if new_uid >= 0 {
            pool.uid = new_uid as u32;
        }
        if new_gid >= 0 {
            pool.gid = new_gid as u32;
        }
        tx.update_pool(&pool)?;
        tx.commit()?;
        Ok(Reply::Ok)
    }

    fn delete_pool(
        &self,
        ctx: &RequestContext,
        uid: u32,
        gid: u32,
        r: &mut WireReader<'_>,
    ) -> Result<Reply, HandlerError> {
        self.require(ctx, uid, gid, Privilege::Admin)?;
        let name = r.get_string(limits::POOL_NAME)?;
        let mut tx = self.store.begin();
        let pool = tx.get_pool(&name)?;
        // A pool still holding volumes cannot go away.
        if pool.capacity != 0 {
            return Err(HandlerError::code(codes::EEXIST));
        }
        tx.delete_pool(&name)?;
        tx.commit()?;
        Ok(Reply::Ok)
    }

    fn query_pool(
        &self,
        ctx: &RequestContext,
        r: &mut WireReader<'_>,
    ) -> Result<Reply, HandlerError> {
        let name = r.get_string(limits::POOL_NAME)?;
        let tx = self.store.begin();
        let pool = tx.get_pool(&name)?;
        let mut w = WireWriter::new();
        w.put_u32(pool.uid);
        w.put_u32(pool.gid);
        put_size(&mut w, ctx, pool.capacity);
        put_size(&mut w, ctx, pool.tot_free_space);
        Ok(Reply::Data(w.into_bytes()))
    }

    // --- libraries ---

    fn enter_library(
        &self,
        ctx: &RequestContext,
        uid: u32,
        gid: u32,
        r: &mut WireReader<'_>,
    ) -> Result<Reply, HandlerError> {
        self.require(ctx, uid, gid, Privilege::Admin)?;
        let name = r.get_string(limits::LIBRARY)?;
        let capacity = r.get_i32()?;
        let status = r.get_i32()?;
        if name.is_empty() || capacity <= 0 {
            return Err(HandlerError::code(codes::EINVAL));
        }
        let mut tx = self.store.begin();
        tx.insert_library(TapeLibrary {
            name,
            capacity,
            nb_free_slots: capacity,
            status,
        })?;
        tx.commit()?;
        Ok(Reply::Ok)
    }

    fn modify_library(
        &self,
        ctx: &RequestContext,
        uid: u32,
        gid: u32,
        r: &mut WireReader<'_>,
    ) -> Result<Reply, HandlerError> {
        self.require(ctx, uid, gid, Privilege::Admin)?;
        let name = r.get_string(limits::LIBRARY)?;
        let capacity = r.get_i32()?;
        let status = r.get_i32()?;
        let mut tx = self.store.begin();
        let mut library = tx.get_library(&name)?;
        if capacity >= 0 {
            // A capacity change moves the free-slot count by the same
            // delta, preserving the occupied count.
            let delta = capacity - library.capacity;
            library.capacity = capacity;
            library.nb_free_slots += delta;
        }
        if status >= 0 {
            library.status = status;
        }
        tx.update_library(&library)?;
        tx.commit()?;
        Ok(Reply::Ok)
    }

    fn delete_library(
        &self,
        ctx: &RequestContext,
        uid: u32,
        gid: u32,
        r: &mut WireReader<'_>,
    ) -> Result<Reply, HandlerError> {
        self.require(ctx, uid, gid, Privilege::Admin)?;
        let name = r.get_string(limits::LIBRARY)?;
        let mut tx = self.store.begin();
        let library = tx.get_library(&name)?;
        if library.capacity != library.nb_free_slots {
            return Err(HandlerError::with_text(
                codes::EEXIST,
                "Library not empty",
            ));
        }
        tx.delete_library(&name)?;
        tx.commit()?;
        Ok(Reply::Ok)
    }

    fn query_library(&self, r: &mut WireReader<'_>) -> Result<Reply, HandlerError> {
        let name = r.get_string(limits::LIBRARY)?;
        let tx = self.store.begin();
        let library = tx.get_library(&name)?;
        let mut w = WireWriter::new();
        w.put_i32(library.capacity);
        w.put_i32(library.nb_free_slots);
        w.put_i32(library.status);
        Ok(Reply::Data(w.into_bytes()))
    }

    // --- density and device-group mappings ---

    fn enter_denmap(
        &self,
        ctx: &RequestContext,
        uid: u32,
        gid: u32,
        r: &mut WireReader<'_>,
    ) -> Result<Reply, HandlerError> {
        self.require(ctx, uid, gid, Privilege::Admin)?;
        let denmap = DensityMapping {
            model: r.get_string(limits::MODEL)?,
            media_letter: r.get_string(limits::MEDIA_LETTER)?,
            density: r.get_string(limits::DENSITY)?,
            native_capacity: get_size(r, ctx)?,
        };
        if denmap.model.is_empty() || denmap.density.is_empty() || denmap.native_capacity == 0 {
            return Err(HandlerError::code(codes::EINVAL));
        }
        let mut tx = self.store.begin();
        tx.get_model(&denmap.model)
            .map_err(|_| HandlerError::with_text(codes::EINVAL, "No such model"))?;
        tx.insert_denmap(denmap)?;
        tx.commit()?;
        Ok(Reply::Ok)
    }

    fn delete_denmap(
        &self,
        ctx: &RequestContext,
        uid: u32,
        gid: u32,
        r: &mut WireReader<'_>,
    ) -> Result<Reply, HandlerError> {
        self.require(ctx, uid, gid, Privilege::Admin)?;
        let model = r.get_string(limits::MODEL)?;
        let media_letter = r.get_string(limits::MEDIA_LETTER)?;
        let density = r.get_string(limits::DENSITY)?;
        let mut tx = self.store.begin();
        tx.delete_denmap(&model, &media_letter, &density)?;
        tx.commit()?;
        Ok(Reply::Ok)
    }

    fn enter_dgnmap(
        &self,
        ctx: &RequestContext,
        uid: u32,
        gid: u32,
        r: &mut WireReader<'_>,
    ) -> Result<Reply, HandlerError> {
        self.require(ctx, uid, gid, Privilege::Admin)?;
        let mapping = DeviceGroupMapping {
            dgn: r.get_string(limits::DGN)?,
            model: r.get_string(limits::MODEL)?,
            library: r.get_string(limits::LIBRARY)?,
        };
        if mapping.dgn.is_empty() {
            return Err(HandlerError::code(codes::EINVAL));
        }
        let mut tx = self.store.begin();
        tx.get_model(&mapping.model)
            .map_err(|_| HandlerError::with_text(codes::EINVAL, "No such model"))?;
        tx.get_library(&mapping.library)
            .map_err(|_| HandlerError::with_text(codes::EINVAL, "No such library"))?;
        let dgn = mapping.dgn.clone();
        tx.insert_dgnmap(mapping)?;
        // First mapping of a group seeds its allocation weight.
        if tx.get_weight(&dgn).is_err() {
            tx.put_weight(DeviceGroupWeight {
                dgn,
                weight: 0,
                delta_weight: 1,
            });
        }
        tx.commit()?;
        Ok(Reply::Ok)
    }

    fn delete_dgnmap(
        &self,
        ctx: &RequestContext,
        uid: u32,
        gid: u32,
        r: &mut WireReader<'_>,
    ) -> Result<Reply, HandlerError> {
        self.require(ctx, uid, gid, Privilege::Admin)?;
        let model = r.get_string(limits::MODEL)?;
        let library = r.get_string(limits::LIBRARY)?;
        let mut tx = self.store.begin();
        let mapping = tx.get_dgnmap(&model, &library)?;
        tx.delete_dgnmap(&model, &library)?;
        // Drop the weight row with the group's last mapping.
        if !tx.list_dgnmaps().iter().any(|m| m.dgn == mapping.dgn) {
            tx.delete_weight(&mapping.dgn);
        }
        tx.commit()?;
        Ok(Reply::Ok)
    }

    // --- allocation and write accounting ---

    fn get_tape(
        &self,
        ctx: &RequestContext,
        uid: u32,
        gid: u32,
        r: &mut WireReader<'_>,
    ) -> Result<Reply, HandlerError> {
        let mut poolname = r.get_string(limits::POOL_NAME)?;
        let size = get_size(r, ctx)?;
        let _condition = r.get_string(limits::CONDITION)?;

        let mut tx = self.store.begin();
        if poolname.is_empty() {
            // The defaulted pool is everybody's; no existence or ownership
            // check before allocation.
            poolname = crate::types::DEFAULT_POOL.to_string();
        } else {
            let pool = tx.get_pool(&poolname)?;
            let owner = (pool.uid == 0 || pool.uid == uid) && (pool.gid == 0 || pool.gid == gid);
            if !owner && !self.privileges.check(uid, gid, &ctx.client_host, Privilege::Admin) {
                return Err(HandlerError::code(codes::EACCES));
            }
        }
        if size == 0 {
            return Err(HandlerError::code(codes::EINVAL));
        }

        let allocation = alloc::allocate_side(&mut tx, &poolname, size)?;
        tx.commit()?;

        let mut w = WireWriter::new();
        w.put_string(&allocation.vid);
        w.put_string(&allocation.vsn);
        w.put_string(&allocation.dgn);
        w.put_string(&allocation.density);
        w.put_string(&allocation.lbltype);
        w.put_string(&allocation.model);
        if ctx.gen2() {
            w.put_u16(allocation.side);
        }
        w.put_i32(allocation.fseq);
        put_size(&mut w, ctx, allocation.estimated_free_space);
        Ok(Reply::Data(w.into_bytes()))
    }

    fn update_tape(
        &self,
        ctx: &RequestContext,
        r: &mut WireReader<'_>,
    ) -> Result<Reply, HandlerError> {
        let vid = r.get_string(limits::VID)?;
        let side = if ctx.gen2() { r.get_u16()? } else { 0 };
        let acct = WriteAccounting {
            bytes_written: get_size(r, ctx)?,
            compression_factor: r.get_u16()?,
            files_written: r.get_u16()?,
            flags: r.get_i32()?,
        };
        let mut tx = self.store.begin();
        alloc::update_after_write(&mut tx, &vid, side, acct)?;
        tx.commit()?;
        Ok(Reply::Ok)
    }

    fn reclaim(
        &self,
        ctx: &RequestContext,
        uid: u32,
        gid: u32,
        r: &mut WireReader<'_>,
    ) -> Result<Reply, HandlerError> {
        self.require(ctx, uid, gid, Privilege::Admin)?;
        let vid = r.get_string(limits::VID)?;
        let mut tx = self.store.begin();
        alloc::reclaim_volume(&mut tx, &vid)?;
        tx.commit()?;
        Ok(Reply::Ok)
    }

    // --- tags ---

    fn tag_access(
        &self,
        ctx: &RequestContext,
        tx: &Transaction<'_>,
        vid: &str,
        uid: u32,
        gid: u32,
    ) -> Result<(), HandlerError> {
        if alloc::caller_owns_volume_pool(tx, vid, uid, gid)?
            || self
                .privileges
                .check(uid, gid, &ctx.client_host, Privilege::TapeOperator)
        {
            Ok(())
        } else {
            Err(HandlerError::code(codes::EACCES))
        }
    }

    fn set_tag(
        &self,
        ctx: &RequestContext,
        uid: u32,
        gid: u32,
        r: &mut WireReader<'_>,
    ) -> Result<Reply, HandlerError> {
        let vid = r.get_string(limits::VID)?;
        let text = r.get_string(limits::TAG)?;
        let mut tx = self.store.begin();
        self.tag_access(ctx, &tx, &vid, uid, gid)?;
        alloc::set_tag(&mut tx, &vid, &text)?;
        tx.commit()?;
        Ok(Reply::Ok)
    }

    // Reading a tag is unrestricted; only set and delete go through
    // `tag_access`.
    fn get_tag(&self, r: &mut WireReader<'_>) -> Result<Reply, HandlerError> {
        let vid = r.get_string(limits::VID)?;
        let tx = self.store.begin();
        let tag = tx.get_tag(&vid)?;
        let mut w = WireWriter::new();
        w.put_string(&tag.text);
        Ok(Reply::Data(w.into_bytes()))
    }

    fn del_tag(
        &self,
        ctx: &RequestContext,
        uid: u32,
        gid: u32,
        r: &mut WireReader<'_>,
    ) -> Result<Reply, HandlerError> {
        let vid = r.get_string(limits::VID)?;
        let mut tx = self.store.begin();
        self.tag_access(ctx, &tx, &vid, uid, gid)?;
        tx.delete_tag(&vid)?;
        tx.commit()?;
        Ok(Reply::Ok)
    }

    // --- mount notification and shutdown ---

    fn tpmounted(
        &self,
        ctx: &RequestContext,
        uid: u32,
        gid: u32,
        r: &mut WireReader<'_>,
    ) -> Result<Reply, HandlerError> {
        self.require(ctx, uid, gid, Privilege::TapeSystem)?;
        let vid = r.get_string(limits::VID)?;
        let mode = r.get_u16()?;
        let jid = r.get_i32()?;
        let mut tx = self.store.begin();
        alloc::record_mount(&mut tx, &vid, mode != 0, jid, &ctx.client_host, now())?;
        tx.commit()?;
        Ok(Reply::Ok)
    }

    fn shutdown(&self, ctx: &RequestContext, uid: u32, gid: u32) -> Result<Reply, HandlerError> {
        self.require(ctx, uid, gid, Privilege::Admin)?;
        info!("event=shutdown_requested uid={} host={}", uid, ctx.client_host);
        Ok(Reply::Shutdown)
    }

    // --- lists ---

    fn begin_list(
        &self,
        ctx: &RequestContext,
        req_type: ReqType,
    ) -> Result<ListCursor, HandlerError> {
        let tx = self.store.begin();
        let cursor = match req_type {
            ReqType::ListTape => {
                let mut sides = tx.list_tapes();
                sides.sort_by(|a, b| a.vid.cmp(&b.vid));
                let mut entries = Vec::new();
                for tape in &sides {
                    for i in 0..tape.nbsides {
                        let side = tx.get_side(&tape.vid, i)?;
                        let mut w = WireWriter::new();
                        w.put_string(&tape.vid);
                        w.put_string(&tape.vsn);
                        w.put_string(&tape.library);
                        w.put_string(&tape.density);
                        w.put_string(&tape.lbltype);
                        w.put_string(&tape.model);
                        w.put_string(&tape.media_letter);
                        if ctx.gen2() {
                            w.put_string(&tape.manufacturer);
                            w.put_string(&tape.sn);
                            w.put_u16(tape.nbsides);
                            w.put_i64(tape.etime);
                            w.put_u16(side.side);
                        }
                        w.put_string(&side.poolname);
                        put_size(&mut w, ctx, side.estimated_free_space);
                        w.put_i32(side.nbfiles);
                        w.put_i32(side.status);
                        entries.push(w.into_bytes());
                    }
                }
                ListCursor::new(entries, TAPE_ENTRY_MAX)
            }
            ReqType::ListPool => {
                let entries = tx
                    .list_pools()
                    .iter()
                    .map(|pool| {
                        let mut w = WireWriter::new();
                        w.put_string(&pool.name);
                        w.put_u32(pool.uid);
                        w.put_u32(pool.gid);
                        put_size(&mut w, ctx, pool.capacity);
                        put_size(&mut w, ctx, pool.tot_free_space);
                        w.into_bytes()
                    })
                    .collect();
                ListCursor::new(entries, POOL_ENTRY_MAX)
            }
            ReqType::ListLibrary => {
                let entries = tx
                    .list_libraries()
                    .iter()
                    .map(|library| {
                        let mut w = WireWriter::new();
                        w.put_string(&library.name);
                        w.put_i32(library.capacity);
                        w.put_i32(library.nb_free_slots);
                        w.put_i32(library.status);
                        w.into_bytes()
                    })
                    .collect();
                ListCursor::new(entries, LIBRARY_ENTRY_MAX)
            }
            ReqType::ListModel => {
                let entries = tx
                    .list_models()
                    .iter()
                    .map(|model| {
                        let mut w = WireWriter::new();
                        w.put_string(&model.model);
                        w.put_string(&model.media_letter);
                        w.put_i32(model.media_cost);
                        w.into_bytes()
                    })
                    .collect();
                ListCursor::new(entries, MODEL_ENTRY_MAX)
            }
            ReqType::ListDenMap => {
                let entries = tx
                    .list_denmaps()
                    .iter()
                    .map(|denmap| {
                        let mut w = WireWriter::new();
                        w.put_string(&denmap.model);
                        w.put_string(&denmap.media_letter);
                        w.put_string(&denmap.density);
                        put_size(&mut w, ctx, denmap.native_capacity);
                        w.into_bytes()
                    })
                    .collect();
                ListCursor::new(entries, DENMAP_ENTRY_MAX)
            }
            ReqType::ListDgnMap => {
                let entries = tx
                    .list_dgnmaps()
                    .iter()
                    .map(|mapping| {
                        let mut w = WireWriter::new();
                        w.put_string(&mapping.dgn);
                        w.put_string(&mapping.model);
                        w.put_string(&mapping.library);
                        w.into_bytes()
                    })
                    .collect();
                ListCursor::new(entries, DGNMAP_ENTRY_MAX)
            }
            _ => return Err(HandlerError::code(codes::EINVAL)),
        };
        Ok(cursor)
    }
}

// Worst-case wire size of one list entry, used to size batches against the
// reply buffer.
const TAPE_ENTRY_MAX: usize = 128;
const POOL_ENTRY_MAX: usize = 40;
const LIBRARY_ENTRY_MAX: usize = 24;
const MODEL_ENTRY_MAX: usize = 16;
const DENMAP_ENTRY_MAX: usize = 32;
const DGNMAP_ENTRY_MAX: usize = 24;

/// Seconds since the epoch.
pub fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Size field: generation 1 carries `u32` kilobytes, generation 2 carries
/// `u64` bytes.
fn get_size(r: &mut WireReader<'_>, ctx: &RequestContext) -> Result<u64, HandlerError> {
    if ctx.gen2() {
        Ok(r.get_u64()?)
    } else {
        Ok(u64::from(r.get_u32()?) * crate::protocol::ONE_KB)
    }
}

fn put_size(w: &mut WireWriter, ctx: &RequestContext, bytes: u64) {
    if ctx.gen2() {
        w.put_u64(bytes);
    } else {
        w.put_u32((bytes / crate::protocol::ONE_KB) as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privilege::StaticPrivileges;
    use crate::protocol::{ReqType, RequestFrame, VMGR_MAGIC2};

    fn fixture() -> (HandlerSet, RequestContext) {
        let store = Arc::new(VolumeStore::in_memory());
        let handlers = HandlerSet::new(store, Arc::new(StaticPrivileges::allow_all()));
        let ctx = RequestContext {
            client_host: "testhost".into(),
            magic: VMGR_MAGIC2,
        };
        (handlers, ctx)
    }

    fn frame(req_type: ReqType, build: impl FnOnce(&mut WireWriter)) -> RequestFrame {
        let mut w = WireWriter::new();
        w.put_u32(100); // uid
        w.put_u32(50); // gid
        build(&mut w);
        RequestFrame {
            magic: VMGR_MAGIC2,
            req_type,
            body: w.into_bytes(),
        }
    }

    fn seed(handlers: &HandlerSet, ctx: &RequestContext) {
        seed_with_pool(handlers, ctx, "POOL1", 0, 0);
    }

    fn seed_with_pool(
        handlers: &HandlerSet,
        ctx: &RequestContext,
        pool: &str,
        pool_uid: u32,
        pool_gid: u32,
    ) {
        let reqs: Vec<RequestFrame> = vec![
            frame(ReqType::EnterLibrary, |w| {
                w.put_string("LIB1");
                w.put_i32(20);
                w.put_i32(0);
            }),
            frame(ReqType::EnterModel, |w| {
                w.put_string("M1");
                w.put_string("A");
                w.put_i32(10);
            }),
            frame(ReqType::EnterPool, |w| {
                w.put_string(pool);
                w.put_u32(pool_uid);
                w.put_u32(pool_gid);
            }),
            frame(ReqType::EnterDenMap, |w| {
                w.put_string("M1");
                w.put_string("A");
                w.put_string("den1");
                w.put_u64(1_000_000);
            }),
            frame(ReqType::EnterDgnMap, |w| {
                w.put_string("DG1");
                w.put_string("M1");
                w.put_string("LIB1");
            }),
            frame(ReqType::EnterTape, |w| {
                w.put_string("VID001");
                w.put_string(""); // vsn defaults to vid
                w.put_string("LIB1");
                w.put_string("den1");
                w.put_string(""); // lbltype defaults to al
                w.put_string("M1");
                w.put_string("");
                w.put_string("");
                w.put_string("");
                w.put_u16(1);
                w.put_string(pool);
                w.put_i32(0);
            }),
        ];
        for req in reqs {
            let reply = handlers.handle(ctx, &req).unwrap();
            assert!(matches!(reply, Reply::Ok));
        }
    }

    #[test]
    fn full_inventory_setup_and_query() {
        let (handlers, ctx) = fixture();
        seed(&handlers, &ctx);

        let reply = handlers
            .handle(
                &ctx,
                &frame(ReqType::QueryTape, |w| {
                    w.put_string("VID001");
                    w.put_u16(0);
                }),
            )
            .unwrap();
        let Reply::Data(payload) = reply else {
            panic!("expected data reply");
        };
        let mut r = WireReader::new(&payload);
        assert_eq!(r.get_string(limits::VSN).unwrap(), "VID001");
        assert_eq!(r.get_string(limits::LIBRARY).unwrap(), "LIB1");
        assert_eq!(r.get_string(limits::DENSITY).unwrap(), "den1");
        assert_eq!(r.get_string(limits::LBLTYPE).unwrap(), "al");
    }

    #[test]
    fn gettape_returns_allocation_and_marks_busy() {
        let (handlers, ctx) = fixture();
        seed(&handlers, &ctx);

        let reply = handlers
            .handle(
                &ctx,
                &frame(ReqType::GetTape, |w| {
                    w.put_string("POOL1");
                    w.put_u64(500_000);
                    w.put_string("");
                }),
            )
            .unwrap();
        let Reply::Data(payload) = reply else {
            panic!("expected data reply");
        };
        let mut r = WireReader::new(&payload);
        assert_eq!(r.get_string(limits::VID).unwrap(), "VID001");
        assert_eq!(r.get_string(limits::VSN).unwrap(), "VID001");
        assert_eq!(r.get_string(limits::DGN).unwrap(), "DG1");

        // The only side is now busy, so a second allocation is refused.
        let err = handlers
            .handle(
                &ctx,
                &frame(ReqType::GetTape, |w| {
                    w.put_string("POOL1");
                    w.put_u64(1);
                    w.put_string("");
                }),
            )
            .unwrap_err();
        assert_eq!(err.code, codes::ENOSPC);
    }

    #[test]
    fn privilege_denied_maps_to_eacces() {
        let store = Arc::new(VolumeStore::in_memory());
        let handlers = HandlerSet::new(store, Arc::new(StaticPrivileges::new(Vec::new())));
        let ctx = RequestContext {
            client_host: "testhost".into(),
            magic: VMGR_MAGIC2,
        };
        let err = handlers
            .handle(
                &ctx,
                &frame(ReqType::EnterPool, |w| {
                    w.put_string("POOL1");
                    w.put_u32(0);
                    w.put_u32(0);
                }),
            )
            .unwrap_err();
        assert_eq!(err.code, codes::EACCES);
    }

    #[test]
    fn truncated_body_is_einval() {
        let (handlers, ctx) = fixture();
        let req = RequestFrame {
            magic: VMGR_MAGIC2,
            req_type: ReqType::QueryTape,
            body: vec![0, 0, 0, 1], // uid only, gid missing
        };
        let err = handlers.handle(&ctx, &req).unwrap_err();
        assert_eq!(err.code, codes::EINVAL);
    }

    #[test]
    fn delete_pool_with_capacity_is_refused() {
        let (handlers, ctx) = fixture();
        seed(&handlers, &ctx);
        let err = handlers
            .handle(
                &ctx,
                &frame(ReqType::DeletePool, |w| {
                    w.put_string("POOL1");
                }),
            )
            .unwrap_err();
        assert_eq!(err.code, codes::EEXIST);
    }

    #[test]
    fn list_cursor_batches_and_terminates() {
        let (handlers, ctx) = fixture();
        seed(&handlers, &ctx);

        let reply = handlers
            .handle(
                &ctx,
                &frame(ReqType::ListTape, |w| {
                    w.put_u16(LIST_BEGIN);
                }),
            )
            .unwrap();
        let Reply::List(mut cursor) = reply else {
            panic!("expected list cursor");
        };
        let (batch, eol) = cursor.next_batch();
        assert!(eol);
        let mut r = WireReader::new(&batch);
        assert_eq!(r.get_u16().unwrap(), 1); // one side entered
        assert_eq!(r.get_string(limits::VID).unwrap(), "VID001");
    }

    #[test]
    fn tag_round_trip_with_owner_access() {
        let (handlers, ctx) = fixture();
        seed(&handlers, &ctx);

        handlers
            .handle(
                &ctx,
                &frame(ReqType::SetTag, |w| {
                    w.put_string("VID001");
                    w.put_string("owned by backup");
                }),
            )
            .unwrap();
        let reply = handlers
            .handle(
                &ctx,
                &frame(ReqType::GetTag, |w| {
                    w.put_string("VID001");
                }),
            )
            .unwrap();
        let Reply::Data(payload) = reply else {
            panic!("expected data reply");
        };
        let mut r = WireReader::new(&payload);
        assert_eq!(r.get_string(limits::TAG).unwrap(), "owned by backup");

        handlers
            .handle(
                &ctx,
                &frame(ReqType::DelTag, |w| {
                    w.put_string("VID001");
                }),
            )
            .unwrap();
        let err = handlers
            .handle(
                &ctx,
                &frame(ReqType::GetTag, |w| {
                    w.put_string("VID001");
                }),
            )
            .unwrap_err();
        assert_eq!(err.code, codes::ENOENT);
    }

    #[test]
    fn tpmounted_updates_write_counters() {
        let (handlers, ctx) = fixture();
        seed(&handlers, &ctx);

        handlers
            .handle(
                &ctx,
                &frame(ReqType::TpMounted, |w| {
                    w.put_string("VID001");
                    w.put_u16(1); // write mount
                    w.put_i32(4242);
                }),
            )
            .unwrap();
        let tx = handlers.store().begin();
        let tape = tx.get_tape("VID001").unwrap();
        assert_eq!(tape.wcount, 1);
        assert_eq!(tape.wjid, 4242);
        assert_eq!(tape.whost, "testhost");
    }

    #[test]
    fn tape_deletion_requires_admin() {
        let store = Arc::new(VolumeStore::in_memory());
        let admin = HandlerSet::new(store.clone(), Arc::new(StaticPrivileges::allow_all()));
        let ctx = RequestContext {
            client_host: "testhost".into(),
            magic: VMGR_MAGIC2,
        };
        seed(&admin, &ctx);

        // An operator may enter and modify volumes but not destroy them.
        let operator = HandlerSet::new(
            store,
            Arc::new(StaticPrivileges::new(vec![crate::privilege::Grant {
                uid: 100,
                gid: None,
                privilege: Privilege::TapeOperator,
            }])),
        );
        let err = operator
            .handle(
                &ctx,
                &frame(ReqType::DeleteTape, |w| {
                    w.put_string("VID001");
                }),
            )
            .unwrap_err();
        assert_eq!(err.code, codes::EACCES);
        assert!(admin.store().begin().get_tape("VID001").is_ok());

        admin
            .handle(
                &ctx,
                &frame(ReqType::DeleteTape, |w| {
                    w.put_string("VID001");
                }),
            )
            .unwrap();
    }

    #[test]
    fn tag_reads_need_no_privilege() {
        let store = Arc::new(VolumeStore::in_memory());
        let admin = HandlerSet::new(store.clone(), Arc::new(StaticPrivileges::allow_all()));
        let ctx = RequestContext {
            client_host: "testhost".into(),
            magic: VMGR_MAGIC2,
        };
        // Pool owned by somebody other than the calling uid/gid.
        seed_with_pool(&admin, &ctx, "POOL1", 4000, 4000);
        admin
            .handle(
                &ctx,
                &frame(ReqType::SetTag, |w| {
                    w.put_string("VID001");
                    w.put_string("scratch");
                }),
            )
            .unwrap();

        let anon = HandlerSet::new(store, Arc::new(StaticPrivileges::new(Vec::new())));
        let reply = anon
            .handle(
                &ctx,
                &frame(ReqType::GetTag, |w| {
                    w.put_string("VID001");
                }),
            )
            .unwrap();
        let Reply::Data(payload) = reply else {
            panic!("expected data reply");
        };
        let mut r = WireReader::new(&payload);
        assert_eq!(r.get_string(limits::TAG).unwrap(), "scratch");

        // Writes keep the owner-or-operator gate.
        let err = anon
            .handle(
                &ctx,
                &frame(ReqType::DelTag, |w| {
                    w.put_string("VID001");
                }),
            )
            .unwrap_err();
        assert_eq!(err.code, codes::EACCES);
    }

    #[test]
    fn default_pool_allocation_skips_ownership_check() {
        let store = Arc::new(VolumeStore::in_memory());
        let admin = HandlerSet::new(store.clone(), Arc::new(StaticPrivileges::allow_all()));
        let ctx = RequestContext {
            client_host: "testhost".into(),
            magic: VMGR_MAGIC2,
        };
        seed_with_pool(&admin, &ctx, crate::types::DEFAULT_POOL, 4000, 4000);

        // Asking by name runs the ownership check against the foreign pool.
        let anon = HandlerSet::new(store, Arc::new(StaticPrivileges::new(Vec::new())));
        let err = anon
            .handle(
                &ctx,
                &frame(ReqType::GetTape, |w| {
                    w.put_string(crate::types::DEFAULT_POOL);
                    w.put_u64(500_000);
                    w.put_string("");
                }),
            )
            .unwrap_err();
        assert_eq!(err.code, codes::EACCES);

        // An empty pool name falls back to the default pool with no check.
        let reply = anon
            .handle(
                &ctx,
                &frame(ReqType::GetTape, |w| {
                    w.put_string("");
                    w.put_u64(500_000);
                    w.put_string("");
                }),
            )
            .unwrap();
        let Reply::Data(payload) = reply else {
            panic!("expected data reply");
        };
        let mut r = WireReader::new(&payload);
        assert_eq!(r.get_string(limits::VID).unwrap(), "VID001");

        // Permissions are decided before the size is validated.
        let err = anon
            .handle(
                &ctx,
                &frame(ReqType::GetTape, |w| {
                    w.put_string(crate::types::DEFAULT_POOL);
                    w.put_u64(0);
                    w.put_string("");
                }),
            )
            .unwrap_err();
        assert_eq!(err.code, codes::EACCES);
    }
}
