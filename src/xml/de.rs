use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::xml::{Call, Fault, Response, Value};

/// Try to parse a `<methodCall>` in the input.
pub(crate) fn read_method_call(input: &str) -> Result<Call> {
    let mut reader = document_reader(input);
    let mut buf = Vec::new();

    expect_root(b"methodCall", &mut reader, &mut buf)?;
    expect_open(b"methodName", &mut reader, &mut buf)?;
    let name = reader.read_text(b"methodName", &mut buf)?;
    expect_open(b"params", &mut reader, &mut buf)?;
    let args = read_params(&mut reader, &mut buf)?;
    reader.read_to_end(b"methodCall", &mut buf)?;

    Ok(Call { name, args })
}

/// Try to parse a `<methodResponse>` in the input.
pub(crate) fn read_method_response(input: &str) -> Result<Response> {
    let mut reader = document_reader(input);
    let mut buf = Vec::new();

    expect_root(b"methodResponse", &mut reader, &mut buf)?;

    match reader.read_event(&mut buf)? {
        Event::Start(ref e) if e.name() == b"params" => {
            let mut vals = read_params(&mut reader, &mut buf)?;
            reader.read_to_end(b"methodResponse", &mut buf)?;
            match vals.pop() {
                Some(val) if vals.is_empty() => Ok(Ok(val)),
                _ => Err(anyhow!("expected a single <param> in a methodResponse")),
            }
        }
        Event::Start(ref e) if e.name() == b"fault" => {
            expect_open(b"value", &mut reader, &mut buf)?;
            let fault = read_fault(&mut reader, &mut buf)?;
            reader.read_to_end(b"methodResponse", &mut buf)?;
            Ok(Err(fault))
        }
        ev => unexpected(ev, "<params> or <fault>"),
    }
}

fn document_reader(input: &str) -> Reader<&[u8]> {
    let mut reader = Reader::from_str(input);
    reader.expand_empty_elements(true);
    reader.trim_text(true);
    reader
}

fn read_fault(reader: &mut Reader<&[u8]>, buf: &mut Vec<u8>) -> Result<Fault> {
    let members = match read_value(reader, buf)? {
        Value::Struct(members) => members,
        v => return Err(anyhow!("expected a <struct> inside <fault>, got {:?}", v)),
    };
    match (members.get("faultCode"), members.get("faultString")) {
        (Some(Value::Int(code)), Some(Value::String(msg))) => Ok(Fault {
            code: *code,
            msg: msg.clone(),
        }),
        _ => Err(anyhow!("malformed <fault> members: {:?}", members)),
    }
}

fn read_params(reader: &mut Reader<&[u8]>, buf: &mut Vec<u8>) -> Result<Vec<Value>> {
    let mut vals = Vec::new();
    loop {
        match reader.read_event(buf)? {
            Event::Start(e) if e.name() == b"param" => {
                expect_open(b"value", reader, buf)?;
                vals.push(read_value(reader, buf)?);
                reader.read_to_end(b"param", buf)?;
            }
            Event::End(e) if e.name() == b"params" => break,
            ev => return unexpected(ev, "<param> or </params>"),
        };
    }
    Ok(vals)
}

fn read_value(reader: &mut Reader<&[u8]>, buf: &mut Vec<u8>) -> Result<Value> {
    let val = match reader.read_event(buf)? {
        Event::Start(e) if e.name() == b"i4" => {
            let i: i32 = reader
                .read_text(b"i4", buf)?
                .parse()
                .context("expected a valid <i4> value")?;
            Value::Int(i)
        }
        Event::Start(e) if e.name() == b"int" => {
            let i: i32 = reader
                .read_text(b"int", buf)?
                .parse()
                .context("expected a valid <int> value")?;
            Value::Int(i)
        }
        Event::Start(e) if e.name() == b"boolean" => {
            match reader.read_text(b"boolean", buf)?.as_ref() {
                "0" => Value::Bool(false),
                "1" => Value::Bool(true),
                txt => return Err(anyhow!("expected 0 or 1 in <boolean>, got {}", txt)),
            }
        }
        Event::Start(e) if e.name() == b"string" => Value::String(reader.read_text(b"string", buf)?),
        Event::Start(e) if e.name() == b"double" => {
            let f: f64 = reader
                .read_text(b"double", buf)?
                .parse()
                .context("expected a valid <double> value")?;
            Value::Double(f)
        }
        Event::Start(e) if e.name() == b"base64" => {
            let text = reader.read_text(b"base64", buf)?;
            Value::Base64(base64_decode(&text)?)
        }
        Event::Start(e) if e.name() == b"array" => read_array(reader, buf)?,
        Event::Start(e) if e.name() == b"struct" => read_struct(reader, buf)?,
        ev => {
            return unexpected(
                ev,
                "<i4>, <int>, <boolean>, <string>, <double>, <base64>, <array> or <struct>",
            )
        }
    };
    reader.read_to_end(b"value", buf)?;
    Ok(val)
}

fn read_array(reader: &mut Reader<&[u8]>, buf: &mut Vec<u8>) -> Result<Value> {
    expect_open(b"data", reader, buf)?;

    let mut vals = Vec::new();
    loop {
        match reader.read_event(buf)? {
            Event::Start(e) if e.name() == b"value" => {
                vals.push(read_value(reader, buf)?);
            }
            Event::End(e) if e.name() == b"data" => {
                reader.read_to_end(b"array", buf)?;
                break;
            }
            ev => return unexpected(ev, "<value> or </data>"),
        };
    }
    Ok(Value::Array(vals))
}

fn read_struct(reader: &mut Reader<&[u8]>, buf: &mut Vec<u8>) -> Result<Value> {
    let mut members = BTreeMap::new();
    loop {
        match reader.read_event(buf)? {
            Event::Start(e) if e.name() == b"member" => {
                expect_open(b"name", reader, buf)?;
                let name = reader.read_text(b"name", buf)?;
                expect_open(b"value", reader, buf)?;
                let val = read_value(reader, buf)?;
                reader.read_to_end(b"member", buf)?;
                members.insert(name, val);
            }
            Event::End(e) if e.name() == b"struct" => break,
            ev => return unexpected(ev, "<member> or </struct>"),
        };
    }
    Ok(Value::Struct(members))
}

/// Decode Base64, tolerating the 76-column `\r\n` wrapping the
/// dedicated server applies to long payloads.
fn base64_decode(text: &str) -> Result<Vec<u8>> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    base64::decode(&compact).context("expected a valid <base64> value")
}

/// Consume the XML declaration, if any, and the root tag.
fn expect_root(root: &[u8], reader: &mut Reader<&[u8]>, buf: &mut Vec<u8>) -> Result<()> {
    loop {
        match reader.read_event(buf)? {
            Event::Decl(_) => continue,
            Event::Start(ref e) if e.name() == root => return Ok(()),
            ev => return unexpected(ev, std::str::from_utf8(root)?),
        }
    }
}

fn expect_open(tag: &[u8], reader: &mut Reader<&[u8]>, buf: &mut Vec<u8>) -> Result<()> {
    match reader.read_event(buf)? {
        Event::Start(ref e) if e.name() == tag => Ok(()),
        ev => unexpected(ev, std::str::from_utf8(tag)?),
    }
}

fn unexpected<T>(got: Event, expected: &str) -> Result<T> {
    Err(anyhow!("XML parser got {:?}, but expected {}", got, expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::write_method_call;

    #[test]
    fn parse_server_call_with_params() {
        let xml = r#"
            <?xml version="1.0" encoding="UTF-8"?>
            <methodCall>
               <methodName>ManiaPlanet.PlayerChat</methodName>
               <params>
                  <param><value><i4>248</i4></value></param>
                  <param><value><string>tim</string></value></param>
                  <param><value><string>gg</string></value></param>
                  <param><value><boolean>0</boolean></value></param>
               </params>
            </methodCall>
        "#;
        let expected = Call {
            name: "ManiaPlanet.PlayerChat".to_string(),
            args: vec![
                Value::Int(248),
                Value::String("tim".to_string()),
                Value::String("gg".to_string()),
                Value::Bool(false),
            ],
        };
        assert_eq!(read_method_call(xml).unwrap(), expected);
    }

    #[test]
    fn parse_server_call_without_params() {
        let xml = r#"
            <?xml version="1.0" encoding="UTF-8"?>
            <methodCall>
               <methodName>ManiaPlanet.BeginMatch</methodName>
               <params>
               </params>
            </methodCall>
        "#;
        let call = read_method_call(xml).unwrap();
        assert_eq!(call.name, "ManiaPlanet.BeginMatch");
        assert!(call.args.is_empty());
    }

    #[test]
    fn parse_response_value() {
        let xml = r#"
            <?xml version="1.0" encoding="UTF-8"?>
            <methodResponse>
               <params>
                  <param><value><string>world</string></value></param>
               </params>
            </methodResponse>
        "#;
        assert_eq!(
            read_method_response(xml).unwrap(),
            Ok(Value::String("world".to_string()))
        );
    }

    #[test]
    fn parse_response_fault() {
        let xml = r#"
            <?xml version="1.0" encoding="UTF-8"?>
            <methodResponse>
               <fault>
                  <value>
                     <struct>
                        <member>
                           <name>faultCode</name>
                           <value><int>-1000</int></value>
                        </member>
                        <member>
                           <name>faultString</name>
                           <value><string>Login unknown.</string></value>
                        </member>
                     </struct>
                  </value>
               </fault>
            </methodResponse>
        "#;
        assert_eq!(
            read_method_response(xml).unwrap(),
            Err(Fault {
                code: -1000,
                msg: "Login unknown.".to_string(),
            })
        );
    }

    #[test]
    fn parse_nested_struct_and_array() {
        let xml = r#"
            <?xml version="1.0" encoding="UTF-8"?>
            <methodResponse>
               <params>
                  <param>
                     <value>
                        <struct>
                           <member>
                              <name>Checkpoints</name>
                              <value><array><data>
                                 <value><i4>13370</i4></value>
                                 <value><i4>26740</i4></value>
                              </data></array></value>
                           </member>
                           <member>
                              <name>Time</name>
                              <value><double>26.74</double></value>
                           </member>
                        </struct>
                     </value>
                  </param>
               </params>
            </methodResponse>
        "#;
        let mut members = BTreeMap::new();
        members.insert(
            "Checkpoints".to_string(),
            Value::Array(vec![Value::Int(13370), Value::Int(26740)]),
        );
        members.insert("Time".to_string(), Value::Double(26.74));
        assert_eq!(read_method_response(xml).unwrap(), Ok(Value::Struct(members)));
    }

    #[test]
    fn parse_wrapped_base64() {
        let xml = r#"
            <?xml version="1.0" encoding="UTF-8"?>
            <methodResponse>
               <params>
                  <param><value><base64>aGVs
bG8=</base64></value></param>
               </params>
            </methodResponse>
        "#;
        assert_eq!(
            read_method_response(xml).unwrap(),
            Ok(Value::Base64(b"hello".to_vec()))
        );
    }

    #[test]
    fn reject_bad_boolean() {
        let xml = r#"
            <?xml version="1.0" encoding="UTF-8"?>
            <methodResponse>
               <params>
                  <param><value><boolean>yes</boolean></value></param>
               </params>
            </methodResponse>
        "#;
        assert!(read_method_response(xml).is_err());
    }

    #[test]
    fn composed_calls_parse_back() {
        let call = Call::new(
            "TriggerModeScriptEventArray",
            vec![
                Value::from("Trackmania.GetScores"),
                Value::Array(vec![Value::from("seq-1")]),
            ],
        );
        let bytes = write_method_call(&call).unwrap();
        let parsed = read_method_call(std::str::from_utf8(&bytes).unwrap()).unwrap();
        assert_eq!(parsed, call);
    }
}
