// src/server/rpc.rs
//! Minimal XML-RPC codec for the request façade
//!
//! Covers what the protocol surface needs: string/boolean/int scalars,
//! arrays of two-string arrays for decision lists, and faults. Values
//! without an explicit type element are strings, per the XML-RPC spec.

use crate::error::{Error, Result};
use crate::xml::Element;

/// A decoded XML-RPC parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcValue {
    String(String),
    Bool(bool),
    Int(i64),
}

impl RpcValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RpcValue::String(s) => Some(s),
            _ => None,
        }
    }
}

/// A decoded method call
#[derive(Debug, Clone)]
pub struct RpcRequest {
    pub method: String,
    pub params: Vec<RpcValue>,
}

impl RpcRequest {
    /// Decode a `<methodCall>` document
    pub fn parse(body: &str) -> Result<Self> {
        let doc = Element::parse(body)?;
        if doc.name != "methodCall" {
            return Err(Error::Xml(format!(
                "expected <methodCall>, found <{}>",
                doc.name
            )));
        }
        let method = doc
            .first_child("methodName")
            .map(|m| m.text.trim().to_string())
            .filter(|m| !m.is_empty())
            .ok_or_else(|| Error::Xml("methodCall without methodName".to_string()))?;

        let mut params = Vec::new();
        if let Some(params_elem) = doc.first_child("params") {
            for param in params_elem.children_named("param") {
                let value = param
                    .first_child("value")
                    .ok_or_else(|| Error::Xml("param without value".to_string()))?;
                params.push(decode_value(value)?);
            }
        }
        Ok(Self { method, params })
    }

    /// The single string parameter of a one-argument method
    pub fn string_arg(&self) -> Result<&str> {
        self.params
            .first()
            .and_then(RpcValue::as_str)
            .ok_or_else(|| Error::Xml(format!("{} expects one string parameter", self.method)))
    }
}

fn decode_value(value: &Element) -> Result<RpcValue> {
    let Some(typed) = value.children.first() else {
        return Ok(RpcValue::String(value.text.clone()));
    };
    match typed.name.as_str() {
        "string" => Ok(RpcValue::String(typed.text.clone())),
        "boolean" => match typed.text.trim() {
            "1" | "true" => Ok(RpcValue::Bool(true)),
            "0" | "false" => Ok(RpcValue::Bool(false)),
            other => Err(Error::Xml(format!("malformed boolean {other:?}"))),
        },
        "int" | "i4" => typed
            .text
            .trim()
            .parse()
            .map(RpcValue::Int)
            .map_err(|_| Error::Xml(format!("malformed int {:?}", typed.text))),
        other => Err(Error::Xml(format!("unsupported value type <{other}>"))),
    }
}

fn wrap_response(value: Element) -> String {
    Element::new("methodResponse")
        .with_child(
            Element::new("params")
                .with_child(Element::new("param").with_child(value)),
        )
        .to_document()
}

/// A successful string response
pub fn respond_string(s: &str) -> String {
    wrap_response(Element::new("value").with_child(Element::new("string").with_text(s)))
}

/// A successful boolean response
pub fn respond_bool(b: bool) -> String {
    wrap_response(Element::new("value").with_child(
        Element::new("boolean").with_text(if b { "1" } else { "0" }),
    ))
}

/// A decision list: array of `[kind, name]` arrays
pub fn respond_pairs(pairs: &[(String, String)]) -> String {
    let mut data = Element::new("data");
    for (kind, name) in pairs {
        let inner = Element::new("array").with_child(
            Element::new("data")
                .with_child(
                    Element::new("value")
                        .with_child(Element::new("string").with_text(kind)),
                )
                .with_child(
                    Element::new("value")
                        .with_child(Element::new("string").with_text(name)),
                ),
        );
        data.children
            .push(Element::new("value").with_child(inner));
    }
    wrap_response(Element::new("value").with_child(Element::new("array").with_child(data)))
}

/// A fault response with the wire fault code for `err`
pub fn respond_fault(err: &Error) -> String {
    fault(err.fault_code(), &err.to_string())
}

pub fn fault(code: i32, message: &str) -> String {
    let members = Element::new("struct")
        .with_child(
            Element::new("member")
                .with_child(Element::new("name").with_text("faultCode"))
                .with_child(
                    Element::new("value")
                        .with_child(Element::new("int").with_text(code.to_string())),
                ),
        )
        .with_child(
            Element::new("member")
                .with_child(Element::new("name").with_text("faultString"))
                .with_child(
                    Element::new("value")
                        .with_child(Element::new("string").with_text(message)),
                ),
        );
    Element::new("methodResponse")
        .with_child(
            Element::new("fault").with_child(Element::new("value").with_child(members)),
        )
        .to_document()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_method_call() {
        let request = RpcRequest::parse(
            r#"<?xml version="1.0"?>
               <methodCall>
                 <methodName>AssertProfile</methodName>
                 <params>
                   <param><value><string>web</string></value></param>
                 </params>
               </methodCall>"#,
        )
        .unwrap();
        assert_eq!(request.method, "AssertProfile");
        assert_eq!(request.string_arg().unwrap(), "web");
    }

    #[test]
    fn test_untyped_value_is_string() {
        let request = RpcRequest::parse(
            "<methodCall><methodName>DeclareVersion</methodName>\
             <params><param><value>2.1</value></param></params></methodCall>",
        )
        .unwrap();
        assert_eq!(request.params, vec![RpcValue::String("2.1".to_string())]);
    }

    #[test]
    fn test_no_params() {
        let request =
            RpcRequest::parse("<methodCall><methodName>GetConfig</methodName></methodCall>")
                .unwrap();
        assert!(request.params.is_empty());
        assert!(request.string_arg().is_err());
    }

    #[test]
    fn test_malformed_call_rejected() {
        assert!(RpcRequest::parse("<methodCall/>").is_err());
        assert!(RpcRequest::parse("<notACall/>").is_err());
        assert!(RpcRequest::parse("plain text").is_err());
    }

    #[test]
    fn test_bool_response_round_trip() {
        let body = respond_bool(true);
        let doc = Element::parse(&body).unwrap();
        let value = doc
            .first_child("params")
            .unwrap()
            .first_child("param")
            .unwrap()
            .first_child("value")
            .unwrap()
            .first_child("boolean")
            .unwrap();
        assert_eq!(value.text, "1");
    }

    #[test]
    fn test_fault_carries_code() {
        let err = Error::MetadataAuth {
            client: "c1".to_string(),
            reason: "bad password".to_string(),
        };
        let body = respond_fault(&err);
        let doc = Element::parse(&body).unwrap();
        let fault_struct = doc
            .first_child("fault")
            .unwrap()
            .first_child("value")
            .unwrap()
            .first_child("struct")
            .unwrap();
        let code = fault_struct
            .children_named("member")
            .find(|m| m.first_child("name").map(|n| n.text == "faultCode").unwrap_or(false))
            .and_then(|m| m.first_child("value"))
            .and_then(|v| v.first_child("int"))
            .map(|i| i.text.clone())
            .unwrap();
        assert_eq!(code, "1");
    }

    #[test]
    fn test_pairs_response_shape() {
        let body = respond_pairs(&[("Service".to_string(), "ntpd".to_string())]);
        let doc = Element::parse(&body).unwrap();
        let outer = doc
            .first_child("params")
            .unwrap()
            .first_child("param")
            .unwrap()
            .first_child("value")
            .unwrap()
            .first_child("array")
            .unwrap()
            .first_child("data")
            .unwrap();
        let first = outer.first_child("value").unwrap().first_child("array").unwrap();
        let strings: Vec<_> = first
            .first_child("data")
            .unwrap()
            .children_named("value")
            .filter_map(|v| v.first_child("string"))
            .map(|s| s.text.clone())
            .collect();
        assert_eq!(strings, vec!["Service", "ntpd"]);
    }
}
