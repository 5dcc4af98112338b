// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The packet taxonomy and its S-expression codec.
//!
//! A packet is one of MSG, CMD or ERR. This module is the only place that
//! knows the wire shapes; everything above it works on tagged values.
//!
//! ```text
//! MSG  (seap.msg :id <uint> [:<attr> <value>]* <payload>)
//! CMD  (seap.cmd :id <uint> [:rid <uint>] :flags <uint>
//!                :class usr|sys :code <uint> <args>)
//! ERR  (seap.err :type usr|int :code <uint> :orig-id <uint> [<data>])
//! ```

use std::ops::{BitOr, BitOrAssign};
use std::vec;

use seap_sexp::SExp;

use crate::message::{Attr, Msg, MsgId};

const MSG_HEAD: &str = "seap.msg";
const CMD_HEAD: &str = "seap.cmd";
const ERR_HEAD: &str = "seap.err";

/// A command code names a remotely invocable operation.
pub type CommandCode = u32;

/// Decode failures; all of them are `EINVAL`-category protocol errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("syntax: {0}")]
    Syntax(#[from] seap_sexp::ParseError),
    #[error("packet is not a list")]
    NotAList,
    #[error("unknown packet head")]
    UnknownHead,
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("malformed field {0}")]
    BadField(&'static str),
    #[error("keyword :{0} is missing its value")]
    MissingValue(String),
    #[error("unexpected item in packet body")]
    UnexpectedItem,
}

/// CMD flag bits, carried verbatim on the wire. Unknown bits survive a
/// decode/encode cycle untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CmdFlags(u32);

impl CmdFlags {
    /// This CMD carries the result of an earlier CMD; its `reply_id` names
    /// that request.
    pub const REPLY: CmdFlags = CmdFlags(0x0000_0001);

    pub const fn empty() -> CmdFlags {
        CmdFlags(0)
    }

    pub const fn from_bits(bits: u32) -> CmdFlags {
        CmdFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: CmdFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CmdFlags {
    type Output = CmdFlags;

    fn bitor(self, rhs: CmdFlags) -> CmdFlags {
        CmdFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for CmdFlags {
    fn bitor_assign(&mut self, rhs: CmdFlags) {
        self.0 |= rhs.0;
    }
}

/// Command class: user-installed handlers vs. the core's own system
/// commands. Each class has its own handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmdClass {
    Usr,
    Sys,
}

impl CmdClass {
    fn token(self) -> &'static str {
        match self {
            CmdClass::Usr => "usr",
            CmdClass::Sys => "sys",
        }
    }

    fn from_token(token: &str) -> Option<CmdClass> {
        match token {
            "usr" => Some(CmdClass::Usr),
            "sys" => Some(CmdClass::Sys),
            _ => None,
        }
    }
}

/// A remote command invocation or its reply.
///
/// The `REPLY` flag and the `reply_id` field travel together: the
/// constructors keep them coherent, and the decoder rejects packets where
/// one is present without the other.
#[derive(Debug, Clone, PartialEq)]
pub struct CmdPacket {
    id: u64,
    reply_id: Option<u64>,
    flags: CmdFlags,
    class: CmdClass,
    code: CommandCode,
    args: SExp,
}

impl CmdPacket {
    /// A fresh request. `id` comes from the descriptor's command id
    /// counter.
    pub fn request(id: u64, class: CmdClass, code: CommandCode, args: SExp) -> CmdPacket {
        CmdPacket {
            id,
            reply_id: None,
            flags: CmdFlags::empty(),
            class,
            code,
            args,
        }
    }

    /// The reply to `request`, carrying the handler's result.
    pub fn reply_to(request: &CmdPacket, id: u64, args: SExp) -> CmdPacket {
        CmdPacket {
            id,
            reply_id: Some(request.id),
            flags: request.flags | CmdFlags::REPLY,
            class: request.class,
            code: request.code,
            args,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn reply_id(&self) -> Option<u64> {
        self.reply_id
    }

    pub fn is_reply(&self) -> bool {
        self.flags.contains(CmdFlags::REPLY)
    }

    pub fn flags(&self) -> CmdFlags {
        self.flags
    }

    pub fn class(&self) -> CmdClass {
        self.class
    }

    pub fn code(&self) -> CommandCode {
        self.code
    }

    pub fn args(&self) -> &SExp {
        &self.args
    }

    pub fn into_args(self) -> SExp {
        self.args
    }

    pub(crate) fn take_args(&mut self) -> SExp {
        std::mem::replace(&mut self.args, SExp::empty())
    }
}

/// Error subtypes: user-level errors raised by the application, internal
/// errors raised by the protocol machinery itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrType {
    User,
    Int,
}

impl ErrType {
    fn token(self) -> &'static str {
        match self {
            ErrType::User => "usr",
            ErrType::Int => "int",
        }
    }

    fn from_token(token: &str) -> Option<ErrType> {
        match token {
            "usr" => Some(ErrType::User),
            "int" => Some(ErrType::Int),
            _ => None,
        }
    }
}

/// A protocol-level error report referencing an earlier packet by id.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrPacket {
    pub etype: ErrType,
    pub code: u32,
    /// Id of the MSG or CMD this error refers to.
    pub orig_id: u64,
    pub data: Option<SExp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Msg,
    Cmd,
    Err,
}

/// A decoded wire packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Msg(Msg),
    Cmd(CmdPacket),
    Err(ErrPacket),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Msg(_) => PacketType::Msg,
            Packet::Cmd(_) => PacketType::Cmd,
            Packet::Err(_) => PacketType::Err,
        }
    }

    pub fn as_msg(&self) -> Option<&Msg> {
        match self {
            Packet::Msg(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn as_cmd(&self) -> Option<&CmdPacket> {
        match self {
            Packet::Cmd(cmd) => Some(cmd),
            _ => None,
        }
    }

    pub fn as_err(&self) -> Option<&ErrPacket> {
        match self {
            Packet::Err(err) => Some(err),
            _ => None,
        }
    }

    /// Translates the packet into its wire S-expression.
    pub fn pack(self) -> SExp {
        match self {
            Packet::Msg(msg) => pack_msg(msg),
            Packet::Cmd(cmd) => pack_cmd(cmd),
            Packet::Err(err) => pack_err(err),
        }
    }

    /// Decodes a wire S-expression into a packet.
    pub fn unpack(sexp: SExp) -> Result<Packet, DecodeError> {
        let SExp::List(items) = sexp else {
            return Err(DecodeError::NotAList);
        };
        let mut iter = items.into_iter();
        let head = iter.next().ok_or(DecodeError::UnknownHead)?;

        match head.as_symbol() {
            Some(MSG_HEAD) => unpack_msg(iter),
            Some(CMD_HEAD) => unpack_cmd(iter),
            Some(ERR_HEAD) => unpack_err(iter),
            _ => Err(DecodeError::UnknownHead),
        }
    }
}

fn pack_msg(msg: Msg) -> SExp {
    let (id, attrs, payload) = msg.into_parts();
    let mut items = vec![SExp::symbol(MSG_HEAD), SExp::keyword("id"), SExp::uint(id)];
    for attr in attrs {
        let (name, value) = attr.into_parts();
        items.push(SExp::Symbol(format!(":{name}")));
        items.push(value);
    }
    items.push(payload);
    SExp::List(items)
}

fn pack_cmd(cmd: CmdPacket) -> SExp {
    let mut items = vec![
        SExp::symbol(CMD_HEAD),
        SExp::keyword("id"),
        SExp::uint(cmd.id),
    ];
    if let Some(rid) = cmd.reply_id {
        items.push(SExp::keyword("rid"));
        items.push(SExp::uint(rid));
    }
    items.push(SExp::keyword("flags"));
    items.push(SExp::uint(u64::from(cmd.flags.bits())));
    items.push(SExp::keyword("class"));
    items.push(SExp::symbol(cmd.class.token()));
    items.push(SExp::keyword("code"));
    items.push(SExp::uint(u64::from(cmd.code)));
    items.push(cmd.args);
    SExp::List(items)
}

fn pack_err(err: ErrPacket) -> SExp {
    let mut items = vec![
        SExp::symbol(ERR_HEAD),
        SExp::keyword("type"),
        SExp::symbol(err.etype.token()),
        SExp::keyword("code"),
        SExp::uint(u64::from(err.code)),
        SExp::keyword("orig-id"),
        SExp::uint(err.orig_id),
    ];
    if let Some(data) = err.data {
        items.push(data);
    }
    SExp::List(items)
}

// Field readers shared by the unpackers.

fn field_uint(value: SExp, name: &'static str) -> Result<u64, DecodeError> {
    value.as_uint().ok_or(DecodeError::BadField(name))
}

fn field_u32(value: SExp, name: &'static str) -> Result<u32, DecodeError> {
    u32::try_from(field_uint(value, name)?).map_err(|_| DecodeError::BadField(name))
}

fn unpack_msg(iter: vec::IntoIter<SExp>) -> Result<Packet, DecodeError> {
    let mut id = None;
    let mut attrs = Vec::new();
    let mut payload = None;

    let mut iter = iter;
    while let Some(item) = iter.next() {
        if let Some(kw) = item.as_keyword() {
            let kw = kw.to_owned();
            let value = iter.next().ok_or(DecodeError::MissingValue(kw.clone()))?;
            if kw == "id" {
                id = Some(field_uint(value, "id")?);
            } else {
                attrs.push(Attr::new(kw, value));
            }
        } else if payload.is_none() {
            payload = Some(item);
        } else {
            return Err(DecodeError::UnexpectedItem);
        }
    }

    let id: MsgId = id.ok_or(DecodeError::MissingField("id"))?;
    let payload = payload.ok_or(DecodeError::MissingField("payload"))?;
    Ok(Packet::Msg(Msg::with_id(id, attrs, payload)))
}

fn unpack_cmd(iter: vec::IntoIter<SExp>) -> Result<Packet, DecodeError> {
    let mut id = None;
    let mut rid = None;
    let mut flags = None;
    let mut class = None;
    let mut code = None;
    let mut args = None;

    let mut iter = iter;
    while let Some(item) = iter.next() {
        if let Some(kw) = item.as_keyword() {
            let kw = kw.to_owned();
            let value = iter.next().ok_or(DecodeError::MissingValue(kw.clone()))?;
            match kw.as_str() {
                "id" => id = Some(field_uint(value, "id")?),
                "rid" => rid = Some(field_uint(value, "rid")?),
                "flags" => flags = Some(CmdFlags::from_bits(field_u32(value, "flags")?)),
                "class" => {
                    class = Some(
                        value
                            .as_symbol()
                            .and_then(CmdClass::from_token)
                            .ok_or(DecodeError::BadField("class"))?,
                    )
                }
                "code" => code = Some(field_u32(value, "code")?),
                _ => return Err(DecodeError::UnexpectedItem),
            }
        } else if args.is_none() {
            args = Some(item);
        } else {
            return Err(DecodeError::UnexpectedItem);
        }
    }

    let flags = flags.ok_or(DecodeError::MissingField("flags"))?;
    if flags.contains(CmdFlags::REPLY) != rid.is_some() {
        return Err(DecodeError::BadField("rid"));
    }

    Ok(Packet::Cmd(CmdPacket {
        id: id.ok_or(DecodeError::MissingField("id"))?,
        reply_id: rid,
        flags,
        class: class.ok_or(DecodeError::MissingField("class"))?,
        code: code.ok_or(DecodeError::MissingField("code"))?,
        args: args.ok_or(DecodeError::MissingField("args"))?,
    }))
}

fn unpack_err(iter: vec::IntoIter<SExp>) -> Result<Packet, DecodeError> {
    let mut etype = None;
    let mut code = None;
    let mut orig_id = None;
    let mut data = None;

    let mut iter = iter;
    while let Some(item) = iter.next() {
        if let Some(kw) = item.as_keyword() {
            let kw = kw.to_owned();
            let value = iter.next().ok_or(DecodeError::MissingValue(kw.clone()))?;
            match kw.as_str() {
                "type" => {
                    etype = Some(
                        value
                            .as_symbol()
                            .and_then(ErrType::from_token)
                            .ok_or(DecodeError::BadField("type"))?,
                    )
                }
                "code" => code = Some(field_u32(value, "code")?),
                "orig-id" => orig_id = Some(field_uint(value, "orig-id")?),
                _ => return Err(DecodeError::UnexpectedItem),
            }
        } else if data.is_none() {
            data = Some(item);
        } else {
            return Err(DecodeError::UnexpectedItem);
        }
    }

    Ok(Packet::Err(ErrPacket {
        etype: etype.ok_or(DecodeError::MissingField("type"))?,
        code: code.ok_or(DecodeError::MissingField("code"))?,
        orig_id: orig_id.ok_or(DecodeError::MissingField("orig-id"))?,
        data,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::REPLY_ID_ATTR;
    use pretty_assertions::assert_eq;

    fn roundtrip(packet: Packet) {
        let wire = packet.clone().pack();
        assert_eq!(Packet::unpack(wire), Ok(packet));
    }

    #[test]
    fn msg_roundtrip_with_attrs() {
        let mut msg = Msg::new(SExp::list(vec![
            SExp::uint(1),
            SExp::uint(2),
            SExp::uint(3),
        ]));
        msg.set_attr(REPLY_ID_ATTR, SExp::uint(7));
        let (_, attrs, payload) = msg.into_parts();
        let msg = Msg::with_id(42, attrs, payload);

        roundtrip(Packet::Msg(msg));
    }

    #[test]
    fn cmd_request_and_reply_roundtrip() {
        let request = CmdPacket::request(1, CmdClass::Usr, 0x10, SExp::empty());
        let reply = CmdPacket::reply_to(
            &request,
            2,
            SExp::list(vec![SExp::symbol("ok")]),
        );
        assert!(reply.is_reply());
        assert_eq!(reply.reply_id(), Some(1));

        roundtrip(Packet::Cmd(request));
        roundtrip(Packet::Cmd(reply));
    }

    #[test]
    fn err_roundtrip_both_subtypes() {
        roundtrip(Packet::Err(ErrPacket {
            etype: ErrType::User,
            code: 13,
            orig_id: 99,
            data: Some(SExp::string("context")),
        }));
        roundtrip(Packet::Err(ErrPacket {
            etype: ErrType::Int,
            code: 5,
            orig_id: 0,
            data: None,
        }));
    }

    #[test]
    fn unknown_head_is_rejected() {
        let wire = SExp::list(vec![SExp::symbol("seap.nope"), SExp::uint(1)]);
        assert_eq!(Packet::unpack(wire), Err(DecodeError::UnknownHead));
        assert_eq!(Packet::unpack(SExp::uint(1)), Err(DecodeError::NotAList));
    }

    #[test]
    fn msg_without_id_or_payload_is_rejected() {
        let wire = SExp::list(vec![SExp::symbol("seap.msg"), SExp::empty()]);
        assert_eq!(
            Packet::unpack(wire),
            Err(DecodeError::MissingField("id"))
        );

        let wire = SExp::list(vec![
            SExp::symbol("seap.msg"),
            SExp::keyword("id"),
            SExp::uint(1),
        ]);
        assert_eq!(
            Packet::unpack(wire),
            Err(DecodeError::MissingField("payload"))
        );
    }

    #[test]
    fn reply_flag_and_rid_must_travel_together() {
        // REPLY set, no :rid.
        let wire = SExp::list(vec![
            SExp::symbol("seap.cmd"),
            SExp::keyword("id"),
            SExp::uint(3),
            SExp::keyword("flags"),
            SExp::uint(u64::from(CmdFlags::REPLY.bits())),
            SExp::keyword("class"),
            SExp::symbol("usr"),
            SExp::keyword("code"),
            SExp::uint(0x10),
            SExp::empty(),
        ]);
        assert_eq!(Packet::unpack(wire), Err(DecodeError::BadField("rid")));

        // :rid present, REPLY clear.
        let wire = SExp::list(vec![
            SExp::symbol("seap.cmd"),
            SExp::keyword("id"),
            SExp::uint(3),
            SExp::keyword("rid"),
            SExp::uint(1),
            SExp::keyword("flags"),
            SExp::uint(0),
            SExp::keyword("class"),
            SExp::symbol("usr"),
            SExp::keyword("code"),
            SExp::uint(0x10),
            SExp::empty(),
        ]);
        assert_eq!(Packet::unpack(wire), Err(DecodeError::BadField("rid")));
    }

    #[test]
    fn trailing_keyword_is_rejected() {
        let wire = SExp::list(vec![
            SExp::symbol("seap.msg"),
            SExp::keyword("id"),
            SExp::uint(1),
            SExp::empty(),
            SExp::keyword("dangling"),
        ]);
        assert_eq!(
            Packet::unpack(wire),
            Err(DecodeError::MissingValue("dangling".into()))
        );
    }

    #[test]
    fn unknown_flag_bits_survive_roundtrip() {
        let mut cmd = CmdPacket::request(9, CmdClass::Sys, 1, SExp::empty());
        cmd.flags = CmdFlags::from_bits(0x80);
        roundtrip(Packet::Cmd(cmd));
    }
}
