//! Just enough of the MANSCDP XML payload to route MESSAGE and NOTIFY.
use crate::Result;
use serde::Deserialize;

/// Envelope fields shared by every MANSCDP command, whatever the root
/// element (`Query`, `Control`, `Notify`, `Response`).
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MessageReceive {
    #[serde(rename = "CmdType")]
    pub cmd_type: String,
    #[serde(rename = "SN")]
    pub sn: String,
    #[serde(rename = "DeviceID")]
    pub device_id: String,
}

/// Decodes the envelope of a command body. Bodies declared as GB2312 are
/// read leniently: the routing fields are plain ASCII.
pub fn decode(body: &[u8]) -> Result<MessageReceive> {
    let text = String::from_utf8_lossy(body);
    Ok(quick_xml::de::from_str(text.trim())?)
}

#[cfg(test)]
mod tests {
    use super::decode;

    #[test]
    fn test_decode_keepalive() {
        let body = b"<?xml version=\"1.0\" encoding=\"GB2312\"?>\r\n<Notify>\r\n<CmdType>Keepalive</CmdType>\r\n<SN>17</SN>\r\n<DeviceID>34020000001320000001</DeviceID>\r\n<Status>OK</Status>\r\n</Notify>\r\n";
        let msg = decode(body).expect("decode");
        assert_eq!(msg.cmd_type, "Keepalive");
        assert_eq!(msg.sn, "17");
        assert_eq!(msg.device_id, "34020000001320000001");
    }

    #[test]
    fn test_decode_nested_catalog() {
        let body = b"<?xml version=\"1.0\"?><Response><CmdType>Catalog</CmdType><SN>2</SN><DeviceID>34020000001320000001</DeviceID><SumNum>1</SumNum><DeviceList Num=\"1\"><Item><DeviceID>34020000001310000001</DeviceID></Item></DeviceList></Response>";
        let msg = decode(body).expect("decode");
        assert_eq!(msg.cmd_type, "Catalog");
        assert_eq!(msg.device_id, "34020000001320000001");
    }

    #[test]
    fn test_decode_garbage() {
        assert!(decode(b"<Notify><CmdType>Keepalive</Notify>").is_err());
    }
}
