use super::{Address, Request, Response};
use crate::{
    transaction::{make_call_id, make_tag, make_via_branch},
    Error, Result, VERSION,
};
use rsip::{
    headers::{ContentLength, Route, UntypedHeader},
    prelude::{HeadersExt, ToTypedHeader},
    Header, Method, Param, StatusCode, StatusCodeKind,
};

/// Builds a new out-of-dialog request.
///
/// `from` gets a fresh tag when it carries none; `to` is used as given.
/// Call-ID is generated, Content-Length is zero until a body is set.
pub fn make_request(
    method: Method,
    uri: rsip::Uri,
    via: rsip::headers::Via,
    from: &Address,
    to: &Address,
    seq: u32,
) -> Request {
    let from = match from.tag() {
        Some(_) => from.clone(),
        None => from.clone().with_tag(make_tag()),
    };
    let headers = vec![
        Header::Via(via),
        Header::From(from.to_from_header().into()),
        Header::To(to.to_to_header().into()),
        Header::CallId(make_call_id()),
        Header::CSeq(rsip::typed::CSeq { seq, method }.into()),
        Header::MaxForwards(70.into()),
        Header::UserAgent(VERSION.to_string().into()),
        Header::ContentLength(ContentLength::default()),
    ];
    Request::new(rsip::Request {
        method,
        uri,
        headers: headers.into(),
        body: vec![],
        version: rsip::Version::V2,
    })
}

/// Builds the response to `req`.
///
/// Via, From, To, Call-ID and CSeq are copied; a To tag is added to
/// non-provisional responses that lack one. The response is addressed to
/// the request's source over the request's connection.
pub fn make_response(
    req: &Request,
    status_code: StatusCode,
    reason: Option<&str>,
    body: Option<Vec<u8>>,
) -> Response {
    let mut headers = req.inner.headers.clone();
    headers.retain(|h| {
        matches!(
            h,
            Header::Via(_) | Header::CallId(_) | Header::From(_) | Header::To(_) | Header::CSeq(_)
        )
    });
    if !matches!(status_code.kind(), StatusCodeKind::Provisional) {
        headers.iter_mut().for_each(|h| {
            if let Header::To(to) = h {
                if let Ok(mut typed) = to.typed() {
                    if !typed.params.iter().any(|p| matches!(p, Param::Tag(_))) {
                        typed.params.push(Param::Tag(make_tag()));
                        *to = typed.into();
                    }
                }
            }
        });
    }
    let body = body.unwrap_or_default();
    headers.push(Header::UserAgent(VERSION.to_string().into()));
    headers.push(Header::ContentLength((body.len() as u32).into()));

    let mut resp = Response::new(rsip::Response {
        status_code,
        version: req.inner.version.clone(),
        headers,
        body,
    });
    resp.reason = reason.map(str::to_string);
    resp.source = req.destination;
    resp.destination = req.source;
    resp.connection = req.connection.clone();
    resp
}

/// Builds the ACK for a final response to an INVITE.
///
/// For a 2xx the ACK is a new transaction: fresh branch, request URI from
/// Contact and a route set from the reversed Record-Route headers. For any
/// other final response it reuses the INVITE's Via and targets the To URI.
pub fn make_ack(resp: &Response) -> Result<Request> {
    let cseq = resp.inner.cseq_header()?;
    if cseq.method()? != Method::Invite {
        return Err(Error::SipMessageError(
            "ACK only answers INVITE responses".to_string(),
        ));
    }
    if resp.is_provisional() {
        return Err(Error::SipMessageError(
            "provisional responses are not acknowledged".to_string(),
        ));
    }

    let mut headers = resp.inner.headers.clone();
    let mut uri = resp.inner.to_header()?.typed()?.uri;

    if resp.inner.status_code.kind() == StatusCodeKind::Successful {
        for h in headers.iter_mut() {
            if let Header::Via(via) = h {
                let mut typed = via.typed()?;
                typed.params.retain(|p| !matches!(p, Param::Branch(_)));
                *via = typed.with_param(make_via_branch()).into();
                break;
            }
        }
        if let Ok(contact) = resp.inner.contact_header() {
            uri = contact.typed()?.uri;
        }
        let mut route_set = resp
            .inner
            .headers
            .iter()
            .filter_map(|h| match h {
                Header::RecordRoute(rr) => Some(Header::Route(Route::new(rr.value()))),
                _ => None,
            })
            .collect::<Vec<_>>();
        route_set.reverse();
        headers.retain(|h| !matches!(h, Header::Route(_)));
        headers.extend(route_set);
    }

    headers.retain(|h| {
        matches!(
            h,
            Header::Via(_)
                | Header::CallId(_)
                | Header::From(_)
                | Header::To(_)
                | Header::CSeq(_)
                | Header::Route(_)
        )
    });
    headers.iter_mut().for_each(|h| {
        if let Header::CSeq(cseq) = h {
            cseq.mut_method(Method::Ack).ok();
        }
    });
    headers.push(Header::MaxForwards(70.into()));
    headers.push(Header::UserAgent(VERSION.to_string().into()));
    headers.push(Header::ContentLength(ContentLength::default()));

    let mut ack = Request::new(rsip::Request {
        method: Method::Ack,
        uri,
        headers,
        body: vec![],
        version: rsip::Version::V2,
    });
    ack.source = resp.destination;
    ack.destination = resp.source;
    ack.connection = resp.connection.clone();
    Ok(ack)
}
