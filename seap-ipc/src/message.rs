// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The MSG payload carrier: an id, an ordered attribute sequence and an
//! S-expression payload.

use seap_sexp::SExp;

/// Message ids are per-descriptor monotonic counters, stamped at send
/// time. Id 0 means "not yet sent".
pub type MsgId = u64;

/// Reserved attribute carrying the echoed id of the message a reply
/// answers. From the receiver's point of view it is an opaque correlation
/// token; the original message does not have to still be known.
pub const REPLY_ID_ATTR: &str = "reply-id";

/// A named attribute attached to a message. Attribute order carries no
/// meaning but is preserved on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    name: String,
    value: SExp,
}

impl Attr {
    pub(crate) fn new(name: String, value: SExp) -> Attr {
        Attr { name, value }
    }

    pub(crate) fn into_parts(self) -> (String, SExp) {
        (self.name, self.value)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &SExp {
        &self.value
    }
}

/// An application message. Construct one around a payload, optionally set
/// attributes, and hand it to [`SeapContext::send_msg`], which stamps the
/// id.
///
/// [`SeapContext::send_msg`]: crate::SeapContext::send_msg
#[derive(Debug, Clone, PartialEq)]
pub struct Msg {
    pub(crate) id: MsgId,
    attrs: Vec<Attr>,
    payload: SExp,
}

impl Msg {
    pub fn new(payload: SExp) -> Msg {
        Msg {
            id: 0,
            attrs: Vec::new(),
            payload,
        }
    }

    pub(crate) fn with_id(id: MsgId, attrs: Vec<Attr>, payload: SExp) -> Msg {
        Msg { id, attrs, payload }
    }

    pub(crate) fn into_parts(self) -> (MsgId, Vec<Attr>, SExp) {
        (self.id, self.attrs, self.payload)
    }

    pub fn id(&self) -> MsgId {
        self.id
    }

    pub fn payload(&self) -> &SExp {
        &self.payload
    }

    /// Extracts the payload, consuming the message.
    pub fn into_payload(self) -> SExp {
        self.payload
    }

    pub fn attrs(&self) -> &[Attr] {
        &self.attrs
    }

    /// Sets an attribute, replacing an existing one of the same name.
    pub fn set_attr(&mut self, name: &str, value: SExp) {
        match self.attrs.iter_mut().find(|a| a.name == name) {
            Some(attr) => attr.value = value,
            None => self.attrs.push(Attr {
                name: name.to_owned(),
                value,
            }),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&SExp> {
        self.attrs
            .iter()
            .find(|a| a.name == name)
            .map(|a| &a.value)
    }

    /// The id of the message this one replies to, when the reserved
    /// `reply-id` attribute is present and well-formed.
    pub fn reply_id(&self) -> Option<MsgId> {
        self.attr(REPLY_ID_ATTR).and_then(SExp::as_uint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn set_attr_replaces_in_place() {
        let mut msg = Msg::new(SExp::empty());
        msg.set_attr("a", SExp::uint(1));
        msg.set_attr("b", SExp::uint(2));
        msg.set_attr("a", SExp::uint(3));

        assert_eq!(msg.attrs().len(), 2);
        assert_eq!(msg.attr("a"), Some(&SExp::uint(3)));
        assert_eq!(msg.attrs()[0].name(), "a");
        assert_eq!(msg.attrs()[1].name(), "b");
    }

    #[test]
    fn reply_id_reads_the_reserved_attribute() {
        let mut msg = Msg::new(SExp::empty());
        assert_eq!(msg.reply_id(), None);

        msg.set_attr(REPLY_ID_ATTR, SExp::uint(42));
        assert_eq!(msg.reply_id(), Some(42));

        msg.set_attr(REPLY_ID_ATTR, SExp::string("junk"));
        assert_eq!(msg.reply_id(), None);
    }
}
