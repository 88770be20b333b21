use std::io::Write;

use anyhow::Result;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::xml::{Call, Value};

/// Compose the `<methodCall>` document for a call.
pub(crate) fn write_method_call(call: &Call) -> Result<Vec<u8>> {
    let mut writer = Writer::new(Vec::new());

    writer.write(br#"<?xml version="1.0" encoding="utf-8"?>"#)?;

    open(&mut writer, b"methodCall")?;
    scalar(&mut writer, b"methodName", &call.name)?;
    open(&mut writer, b"params")?;
    for arg in &call.args {
        open(&mut writer, b"param")?;
        write_value(&mut writer, arg)?;
        close(&mut writer, b"param")?;
    }
    close(&mut writer, b"params")?;
    close(&mut writer, b"methodCall")?;

    Ok(writer.into_inner())
}

fn write_value<W>(writer: &mut Writer<W>, value: &Value) -> Result<()>
where
    W: Write,
{
    open(writer, b"value")?;
    match value {
        Value::Int(i) => scalar(writer, b"i4", &i.to_string())?,
        Value::Bool(b) => scalar(writer, b"boolean", if *b { "1" } else { "0" })?,
        Value::String(s) => scalar(writer, b"string", s)?,
        Value::Double(f) => scalar(writer, b"double", &f.to_string())?,
        Value::Base64(bytes) => scalar(writer, b"base64", &base64_encode(bytes))?,
        Value::Array(vs) => {
            open(writer, b"array")?;
            open(writer, b"data")?;
            for v in vs {
                write_value(writer, v)?;
            }
            close(writer, b"data")?;
            close(writer, b"array")?;
        }
        Value::Struct(members) => {
            open(writer, b"struct")?;
            for (name, member) in members {
                open(writer, b"member")?;
                scalar(writer, b"name", name)?;
                write_value(writer, member)?;
                close(writer, b"member")?;
            }
            close(writer, b"struct")?;
        }
    }
    close(writer, b"value")?;
    Ok(())
}

fn scalar<W>(writer: &mut Writer<W>, tag: &[u8], text: &str) -> Result<()>
where
    W: Write,
{
    open(writer, tag)?;
    writer.write_event(Event::Text(BytesText::from_plain_str(text)))?;
    close(writer, tag)?;
    Ok(())
}

fn open<W>(writer: &mut Writer<W>, tag: &[u8]) -> Result<()>
where
    W: Write,
{
    writer.write_event(Event::Start(BytesStart::borrowed_name(tag)))?;
    Ok(())
}

fn close<W>(writer: &mut Writer<W>, tag: &[u8]) -> Result<()>
where
    W: Write,
{
    writer.write_event(Event::End(BytesEnd::borrowed(tag)))?;
    Ok(())
}

/// Encode bytes to Base64, wrapped at 76 characters with `\r\n`
/// to mimic the dedicated server's MIME-style output.
fn base64_encode(bytes: &[u8]) -> String {
    const LINE_LENGTH: usize = 76;

    let encoded = base64::encode(bytes);

    let mut wrapped = String::with_capacity(encoded.len() + encoded.len() / LINE_LENGTH * 2);
    for (i, c) in encoded.chars().enumerate() {
        if i > 0 && i % LINE_LENGTH == 0 {
            wrapped.push_str("\r\n");
        }
        wrapped.push(c);
    }
    wrapped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compose(call: Call) -> String {
        String::from_utf8(write_method_call(&call).unwrap()).unwrap()
    }

    #[test]
    fn compose_call_without_args() {
        let xml = compose(Call::new("GetVersion", vec![]));
        assert_eq!(
            xml,
            r#"<?xml version="1.0" encoding="utf-8"?><methodCall><methodName>GetVersion</methodName><params></params></methodCall>"#
        );
    }

    #[test]
    fn compose_call_with_args() {
        let xml = compose(Call::new(
            "ChatSendServerMessage",
            vec![Value::from("hey"), Value::from(true)],
        ));
        assert_eq!(
            xml,
            r#"<?xml version="1.0" encoding="utf-8"?><methodCall><methodName>ChatSendServerMessage</methodName><params><param><value><string>hey</string></value></param><param><value><boolean>1</boolean></value></param></params></methodCall>"#
        );
    }

    #[test]
    fn string_args_are_escaped() {
        let xml = compose(Call::new("ChatSendServerMessage", vec![Value::from("a <b> & c")]));
        assert!(xml.contains("<string>a &lt;b&gt; &amp; c</string>"));
    }

    #[test]
    fn base64_wraps_at_76_columns() {
        let encoded = base64_encode(&[0xab; 120]);
        let mut lines = encoded.split("\r\n");
        assert_eq!(lines.next().map(str::len), Some(76));
        assert!(lines.next().is_some());
    }
}
