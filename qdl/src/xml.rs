// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use indexmap::IndexMap;
use tracing::debug;
use xmltree::{Element, XMLNode};

use crate::error::{QdlError, Result};

const XML_DOC_PREFIX: &[u8] = b"<?xml";

/// Wrapper for easily creating Firehose-y XML packets
pub fn xml_build(op: &str, kvps: &[(&str, String)]) -> Result<Vec<u8>> {
    let mut xml = Element::new("data");
    let mut op_node = Element::new(op);
    for (k, v) in kvps.iter() {
        op_node.attributes.insert((*k).to_owned(), v.to_owned());
    }

    xml.children.push(XMLNode::Element(op_node));

    let mut buf = Vec::<u8>::new();
    xml.write(&mut buf).map_err(|e| QdlError::Validation {
        field: "xml",
        reason: format!("couldn't serialize <{op}>: {e}"),
    })?;

    Ok(buf)
}

/// The peer concatenates whole XML documents into one bulk transfer and may
/// prepend non-XML noise; carve the buffer into per-document fragments.
pub fn split_documents(buf: &[u8]) -> Vec<&[u8]> {
    let mut starts: Vec<usize> = vec![];
    let mut pos = 0;
    while pos + XML_DOC_PREFIX.len() <= buf.len() {
        if &buf[pos..pos + XML_DOC_PREFIX.len()] == XML_DOC_PREFIX {
            starts.push(pos);
            pos += XML_DOC_PREFIX.len();
        } else {
            pos += 1;
        }
    }

    let mut frags = Vec::with_capacity(starts.len());
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(buf.len());
        frags.push(&buf[start..end]);
    }
    frags
}

fn data_elements(frag: &[u8]) -> Vec<Element> {
    let root = match Element::parse(frag) {
        Ok(e) => e,
        Err(e) => {
            debug!("skipping unparseable XML fragment: {e}");
            return vec![];
        }
    };

    if root.name != "data" {
        // Some loaders skip the <data> wrapper on log spam
        return vec![root];
    }

    root.children
        .into_iter()
        .filter_map(|n| match n {
            XMLNode::Element(e) => Some(e),
            _ => None,
        })
        .collect()
}

/// Flatten the attributes of every `<response>` element, in document order,
/// with later occurrences overriding earlier ones.
pub fn get_response(buf: &[u8]) -> IndexMap<String, String> {
    let mut attrs = IndexMap::new();

    for frag in split_documents(buf) {
        for e in data_elements(frag) {
            if e.name == "response" {
                attrs.extend(e.attributes);
            }
        }
    }

    attrs
}

/// The `value` attributes of every `<log>` element, in document order.
pub fn get_log(buf: &[u8]) -> Vec<String> {
    let mut logs = vec![];

    for frag in split_documents(buf) {
        for e in data_elements(frag) {
            if e.name == "log" {
                if let Some(v) = e.attributes.get("value") {
                    logs.push(v.to_owned());
                }
            }
        }
    }

    logs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(inner: &str) -> Vec<u8> {
        format!("<?xml version=\"1.0\" ?><data>{inner}</data>").into_bytes()
    }

    #[test]
    fn response_attributes() {
        let buf = doc("<response value=\"ACK\" MemoryName=\"eMMC\"/>");
        let attrs = get_response(&buf);
        assert_eq!(attrs.get("value").unwrap(), "ACK");
        assert_eq!(attrs.get("MemoryName").unwrap(), "eMMC");
        assert_eq!(attrs.len(), 2);
    }

    #[test]
    fn log_stream_before_response() {
        let mut buf = vec![];
        for i in 0..18 {
            buf.extend(doc(&format!("<log value=\"line {i}\"/>")));
        }
        buf.extend(doc("<response value=\"ACK\" rawmode=\"false\"/>"));

        let attrs = get_response(&buf);
        assert_eq!(attrs.get("value").unwrap(), "ACK");
        assert_eq!(attrs.get("rawmode").unwrap(), "false");

        let logs = get_log(&buf);
        assert_eq!(logs.len(), 18);
        assert_eq!(logs[0], "line 0");
        assert_eq!(logs[17], "line 17");
    }

    #[test]
    fn later_response_wins() {
        let mut buf = doc("<response value=\"NAK\" rawmode=\"true\"/>");
        buf.extend(doc("<response value=\"ACK\" rawmode=\"false\"/>"));

        let attrs = get_response(&buf);
        assert_eq!(attrs.get("value").unwrap(), "ACK");
        assert_eq!(attrs.get("rawmode").unwrap(), "false");
    }

    #[test]
    fn noise_before_first_document() {
        let mut buf = vec![0u8, 0xff, b'g', b'a', b'r'];
        buf.extend(doc("<response value=\"ACK\"/>"));

        let attrs = get_response(&buf);
        assert_eq!(attrs.get("value").unwrap(), "ACK");
    }

    #[test]
    fn empty_input() {
        assert!(get_response(b"").is_empty());
        assert!(get_log(b"").is_empty());
    }

    #[test]
    fn build_wraps_in_data() {
        let buf = xml_build("configure", &[("MemoryName", "UFS".to_string())]).unwrap();
        let s = String::from_utf8(buf).unwrap();
        assert!(s.starts_with("<?xml"));
        assert!(s.contains("<data>"));
        assert!(s.contains("MemoryName=\"UFS\""));
    }
}
