use crate::{Error, Result};
use rsip::{
    headers::UntypedHeader,
    param::Tag,
    prelude::ToTypedHeader,
    Param,
};
use std::{fmt, str::FromStr};

/// A display name plus URI plus header parameters, as carried by From, To
/// and Contact. Two addresses are equal when their canonical forms are.
#[derive(Debug, Clone, Default)]
pub struct Address {
    pub display_name: Option<String>,
    pub uri: rsip::Uri,
    pub params: Vec<Param>,
}

impl Address {
    pub fn new(uri: rsip::Uri) -> Self {
        Address {
            display_name: None,
            uri,
            params: vec![],
        }
    }

    /// User part of the URI, the device or platform id in GB28181.
    pub fn user(&self) -> Option<&str> {
        self.uri.auth.as_ref().map(|auth| auth.user.as_str())
    }

    pub fn host(&self) -> String {
        self.uri.host_with_port.host.to_string()
    }

    pub fn port(&self) -> Option<u16> {
        self.uri.host_with_port.port.as_ref().map(|p| *p.value())
    }

    pub fn tag(&self) -> Option<&Tag> {
        self.params.iter().find_map(|p| match p {
            Param::Tag(tag) => Some(tag),
            _ => None,
        })
    }

    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.params.retain(|p| !matches!(p, Param::Tag(_)));
        self.params.push(Param::Tag(tag));
        self
    }

    pub fn without_tag(mut self) -> Self {
        self.params.retain(|p| !matches!(p, Param::Tag(_)));
        self
    }

    pub fn to_from_header(&self) -> rsip::typed::From {
        rsip::typed::From {
            display_name: self.display_name.clone(),
            uri: self.uri.clone(),
            params: self.params.clone(),
        }
    }

    pub fn to_to_header(&self) -> rsip::typed::To {
        rsip::typed::To {
            display_name: self.display_name.clone(),
            uri: self.uri.clone(),
            params: self.params.clone(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = self.display_name.as_deref().filter(|n| !n.is_empty()) {
            write!(f, "\"{}\" ", name)?;
        }
        write!(f, "<{}>", self.uri)?;
        for param in &self.params {
            write!(f, "{}", param)?;
        }
        Ok(())
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

impl Eq for Address {}

impl FromStr for Address {
    type Err = Error;

    /// Accepts a name-addr (`"Name" <sip:user@host>;tag=x`) or a bare URI.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::SipMessageError("empty address".to_string()));
        }
        if s.contains('<') {
            let typed = rsip::headers::From::new(s).typed()?;
            return Ok(typed.into());
        }
        Ok(Address::new(rsip::Uri::try_from(s)?))
    }
}

impl From<rsip::typed::From> for Address {
    fn from(from: rsip::typed::From) -> Self {
        Address {
            display_name: from.display_name,
            uri: from.uri,
            params: from.params,
        }
    }
}

impl From<rsip::typed::To> for Address {
    fn from(to: rsip::typed::To) -> Self {
        Address {
            display_name: to.display_name,
            uri: to.uri,
            params: to.params,
        }
    }
}

impl From<&Address> for rsip::typed::From {
    fn from(addr: &Address) -> Self {
        addr.to_from_header()
    }
}

impl From<&Address> for rsip::typed::To {
    fn from(addr: &Address) -> Self {
        addr.to_to_header()
    }
}
