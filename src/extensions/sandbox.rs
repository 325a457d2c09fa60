// Extension Sandbox - per-extension global scopes
//
// Every extension runs in a QuickJS context of its own, so globals and
// intrinsics (Math, Array.prototype, ...) are never shared. The bootstrap
// script below is evaluated once per context and supplies the host-backed
// globals: console, process, URL and Buffer.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use rquickjs::{Ctx, Exception, Function, Object, Value};

use super::builtins::{node_arch, node_platform};
use super::types::SandboxTemplate;

/// Evaluated once per context; returns the factories used to fill its globals.
pub const BOOTSTRAP: &str = r#"
(function (urlParse, write, encode, decode) {
    function format(args) {
        return Array.prototype.map.call(args, function (arg) {
            if (typeof arg === "string") return arg;
            if (arg instanceof Error) return arg.stack ? arg.name + ": " + arg.message + "\n" + arg.stack : String(arg);
            try {
                var text = JSON.stringify(arg);
                return text === undefined ? String(arg) : text;
            } catch (e) {
                return String(arg);
            }
        }).join(" ");
    }

    function makeConsole() {
        var out = function () { write(1, format(arguments)); };
        var err = function () { write(2, format(arguments)); };
        return { log: out, info: out, debug: out, trace: out, warn: err, error: err };
    }

    function makeProcess(env, info) {
        var proc = {
            env: env,
            platform: info.platform,
            arch: info.arch,
            argv: info.argv,
            pid: info.pid,
            versions: {},
            cwd: function () { return info.cwd; }
        };
        var chain = function () { return proc; };
        proc.on = chain;
        proc.once = chain;
        proc.off = chain;
        proc.addListener = chain;
        proc.removeListener = chain;
        proc.removeAllListeners = chain;
        proc.emit = function () { return false; };
        return proc;
    }

    function URL(input, base) {
        if (!(this instanceof URL)) throw new TypeError("Constructor URL requires 'new'");
        var parts = JSON.parse(urlParse(String(input), base === undefined ? undefined : String(base)));
        if (parts.error) throw new TypeError("Invalid URL: " + input);
        for (var key in parts) this[key] = parts[key];
    }
    URL.prototype.toString = function () { return this.href; };
    URL.prototype.toJSON = function () { return this.href; };

    function plain(bytes, start, end) {
        return Array.prototype.slice.call(bytes, start, end);
    }

    function encodingOf(encoding) {
        return encoding === undefined || encoding === null ? "utf8" : String(encoding);
    }

    class Buffer extends Uint8Array {
        static from(value, encodingOrOffset, length) {
            if (typeof value === "string") {
                return fromBytes(decode(value, encodingOf(encodingOrOffset)));
            }
            if (value instanceof ArrayBuffer) {
                var offset = encodingOrOffset === undefined ? 0 : encodingOrOffset;
                return new Buffer(value, offset, length === undefined ? value.byteLength - offset : length);
            }
            if (value && typeof value === "object") {
                if (value.type === "Buffer" && Array.isArray(value.data)) return fromBytes(value.data);
                if (typeof value.length === "number") return fromBytes(value);
            }
            throw new TypeError("The first argument must be a string, Buffer, ArrayBuffer or array-like object");
        }

        static alloc(size, fill, encoding) {
            var buf = new Buffer(size);
            if (typeof fill === "number") {
                buf.fill(fill);
            } else if (fill !== undefined) {
                var pattern = Buffer.from(fill, encoding);
                for (var i = 0; pattern.length > 0 && i < size; i++) buf[i] = pattern[i % pattern.length];
            }
            return buf;
        }

        static isBuffer(value) {
            return value instanceof Buffer;
        }

        static byteLength(value, encoding) {
            if (typeof value === "string") return decode(value, encodingOf(encoding)).length;
            if (value instanceof ArrayBuffer || ArrayBuffer.isView(value)) return value.byteLength;
            throw new TypeError("Argument must be a string, Buffer or ArrayBuffer");
        }

        static concat(list, totalLength) {
            var total = 0;
            list.forEach(function (item) { total += item.length; });
            var size = totalLength === undefined ? total : totalLength;
            var out = new Buffer(size);
            var offset = 0;
            for (var i = 0; i < list.length && offset < size; i++) {
                var item = list[i].length > size - offset ? list[i].subarray(0, size - offset) : list[i];
                out.set(item, offset);
                offset += item.length;
            }
            return out;
        }

        toString(encoding, start, end) {
            return encode(plain(this, start === undefined ? 0 : start, end === undefined ? this.length : end), encodingOf(encoding));
        }

        toJSON() {
            return { type: "Buffer", data: plain(this) };
        }

        equals(other) {
            if (this.length !== other.length) return false;
            for (var i = 0; i < this.length; i++) {
                if (this[i] !== other[i]) return false;
            }
            return true;
        }
    }

    function fromBytes(bytes) {
        var buf = new Buffer(bytes.length);
        buf.set(bytes);
        return buf;
    }

    return {
        makeConsole: makeConsole,
        makeProcess: makeProcess,
        URL: URL,
        Buffer: Buffer
    };
})
"#;

/// Everything needed to build one extension's global scope. A pure value:
/// the same template and host environment always give the same context.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    pub env: BTreeMap<String, String>,
    pub globals: serde_json::Map<String, serde_json::Value>,
    pub cwd: String,
    pub argv: Vec<String>,
    pub platform: &'static str,
    pub arch: &'static str,
}

impl ExecutionContext {
    pub fn from_template(
        template: &SandboxTemplate,
        host_env: &BTreeMap<String, String>,
        cwd: &Path,
    ) -> Self {
        Self {
            env: template.env.clone().unwrap_or_else(|| host_env.clone()),
            globals: template.globals.clone().unwrap_or_default(),
            cwd: cwd.to_string_lossy().into_owned(),
            argv: vec!["extension-host".to_string()],
            platform: node_platform(),
            arch: node_arch(),
        }
    }
}

/// Evaluate the bootstrap in `ctx` with the Rust helpers it closes over.
pub fn bootstrap<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
    let factory: Function = ctx.eval(BOOTSTRAP)?;
    let url_parse = Function::new(ctx.clone(), |input: String, base: Option<String>| {
        parse_url(&input, base.as_deref())
    })?;
    let write = Function::new(ctx.clone(), |stream: i32, text: String| {
        write_stream(stream, &text);
    })?;
    let encode = Function::new(ctx.clone(), |ctx: Ctx<'js>, bytes: Vec<u8>, encoding: String| {
        match Encoding::parse(&encoding) {
            Some(encoding) => Ok(encoding.encode(&bytes)),
            None => Err(unknown_encoding(&ctx, &encoding)),
        }
    })?;
    let decode = Function::new(ctx.clone(), |ctx: Ctx<'js>, text: String, encoding: String| {
        match Encoding::parse(&encoding) {
            Some(encoding) => Ok(encoding.decode(&text)),
            None => Err(unknown_encoding(&ctx, &encoding)),
        }
    })?;
    factory.call((url_parse, write, encode, decode))
}

/// Fill the global object of `ctx` for `context`. `ctx` must belong to a
/// fresh context. Returns the bootstrap so host modules can share its URL
/// and Buffer.
pub fn install<'js>(ctx: &Ctx<'js>, context: &ExecutionContext) -> rquickjs::Result<Object<'js>> {
    let boot = bootstrap(ctx)?;
    let globals = ctx.globals();

    for (key, value) in &context.globals {
        globals.set(key.as_str(), json_to_js(ctx, value)?)?;
    }

    // Parsed from JSON so the env object is a copy, never shared.
    let env = json_to_js(ctx, &serde_json::to_value(&context.env).unwrap_or_default())?;
    let info = serde_json::json!({
        "platform": context.platform,
        "arch": context.arch,
        "argv": context.argv,
        "cwd": context.cwd,
        "pid": std::process::id(),
    });
    let make_process: Function = boot.get("makeProcess")?;
    let process: Value = make_process.call((env, json_to_js(ctx, &info)?))?;
    globals.set("process", process)?;

    let make_console: Function = boot.get("makeConsole")?;
    let console: Value = make_console.call(())?;
    globals.set("console", console)?;

    globals.set("URL", boot.get::<_, Value>("URL")?)?;
    globals.set("Buffer", boot.get::<_, Value>("Buffer")?)?;
    globals.set("global", globals.clone())?;

    Ok(boot)
}

fn unknown_encoding(ctx: &Ctx<'_>, encoding: &str) -> rquickjs::Error {
    Exception::throw_type(ctx, &format!("Unknown encoding: {}", encoding))
}

/// Text encodings understood by Buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Utf8,
    Base64,
    Base64Url,
    Hex,
    Latin1,
}

impl Encoding {
    fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Some(Self::Utf8),
            "base64" => Some(Self::Base64),
            "base64url" => Some(Self::Base64Url),
            "hex" => Some(Self::Hex),
            "latin1" | "binary" | "ascii" => Some(Self::Latin1),
            _ => None,
        }
    }

    fn encode(self, bytes: &[u8]) -> String {
        match self {
            Self::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Self::Base64 => base64::engine::general_purpose::STANDARD.encode(bytes),
            Self::Base64Url => base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes),
            Self::Hex => hex::encode(bytes),
            Self::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
        }
    }

    /// Malformed input decodes as far as it is valid, like Node does.
    fn decode(self, text: &str) -> Vec<u8> {
        match self {
            Self::Utf8 => text.as_bytes().to_vec(),
            Self::Base64 | Self::Base64Url => decode_base64(text),
            Self::Hex => {
                let valid = text.bytes().take_while(u8::is_ascii_hexdigit).count();
                hex::decode(&text[..valid - valid % 2]).unwrap_or_default()
            }
            Self::Latin1 => text.chars().map(|c| (u32::from(c) & 0xff) as u8).collect(),
        }
    }
}

/// Accepts both alphabets, with or without padding, ignoring whitespace.
fn decode_base64(text: &str) -> Vec<u8> {
    const LENIENT: GeneralPurpose = GeneralPurpose::new(
        &alphabet::STANDARD,
        GeneralPurposeConfig::new()
            .with_decode_padding_mode(DecodePaddingMode::Indifferent)
            .with_decode_allow_trailing_bits(true),
    );

    let mut cleaned: String = text
        .chars()
        .filter(|c| !c.is_whitespace())
        .take_while(|c| *c != '=')
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '+' || *c == '/')
        .collect();
    if cleaned.len() % 4 == 1 {
        cleaned.pop();
    }
    LENIENT.decode(cleaned).unwrap_or_default()
}

pub fn json_to_js<'js>(ctx: &Ctx<'js>, value: &serde_json::Value) -> rquickjs::Result<Value<'js>> {
    let text = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
    ctx.json_parse(text)
}

/// JSON projection of a JS value. `undefined` and functions become null.
pub fn js_to_json<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<serde_json::Value> {
    let Some(text) = ctx.json_stringify(value)? else {
        return Ok(serde_json::Value::Null);
    };
    let text = text.to_string()?;
    serde_json::from_str(&text).map_err(|e| {
        rquickjs::Exception::throw_message(ctx, &format!("Failed to convert value to JSON: {}", e))
    })
}

fn parse_url(input: &str, base: Option<&str>) -> String {
    let parsed = match base {
        Some(base) => url::Url::parse(base).and_then(|b| b.join(input)),
        None => url::Url::parse(input),
    };
    let url = match parsed {
        Ok(url) => url,
        Err(e) => return serde_json::json!({ "error": e.to_string() }).to_string(),
    };

    let hostname = url.host_str().unwrap_or_default().to_string();
    let port = url.port().map(|p| p.to_string()).unwrap_or_default();
    let host = if port.is_empty() {
        hostname.clone()
    } else {
        format!("{}:{}", hostname, port)
    };

    serde_json::json!({
        "href": url.as_str(),
        "protocol": format!("{}:", url.scheme()),
        "username": url.username(),
        "password": url.password().unwrap_or_default(),
        "host": host,
        "hostname": hostname,
        "port": port,
        "pathname": url.path(),
        "search": url.query().map(|q| format!("?{}", q)).unwrap_or_default(),
        "hash": url.fragment().map(|f| format!("#{}", f)).unwrap_or_default(),
        "origin": url.origin().ascii_serialization(),
    })
    .to_string()
}

fn write_stream(stream: i32, text: &str) {
    let result = if stream == 2 {
        writeln!(std::io::stderr(), "{}", text)
    } else {
        writeln!(std::io::stdout(), "{}", text)
    };
    if let Err(e) = result {
        log::error!("Failed to write extension console output: {}", e);
    }
}
