// Host built-in modules
//
// The small set of Node-style core modules extensions may require when the
// manager allows built-ins: `path` (POSIX flavour), `os`, `url` and
// `buffer`.

use rquickjs::function::{Opt, Rest};
use rquickjs::{Ctx, Function, Object, Value};

pub const BUILTIN_MODULES: &[&str] = &["path", "os", "url", "buffer"];

/// Canonical built-in name for `request` (`node:` prefix accepted).
pub fn builtin_name(request: &str) -> Option<&'static str> {
    let bare = request.strip_prefix("node:").unwrap_or(request);
    BUILTIN_MODULES.iter().copied().find(|m| *m == bare)
}

/// Node's name for the host platform.
pub fn node_platform() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        "windows" => "win32",
        other => other,
    }
}

/// Node's name for the host CPU architecture.
pub fn node_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "x64",
        "x86" => "ia32",
        "aarch64" => "arm64",
        "powerpc64" => "ppc64",
        other => other,
    }
}

pub fn create_module<'js>(
    ctx: &Ctx<'js>,
    name: &str,
    cwd: &str,
    bootstrap: &Object<'js>,
) -> rquickjs::Result<Object<'js>> {
    match name {
        "path" => path_module(ctx, cwd),
        "os" => os_module(ctx),
        "url" | "buffer" => {
            let export = if name == "url" { "URL" } else { "Buffer" };
            let module = Object::new(ctx.clone())?;
            module.set(export, bootstrap.get::<_, Value>(export)?)?;
            Ok(module)
        }
        other => Err(rquickjs::Exception::throw_message(
            ctx,
            &format!("Unknown built-in module '{}'", other),
        )),
    }
}

fn path_module<'js>(ctx: &Ctx<'js>, cwd: &str) -> rquickjs::Result<Object<'js>> {
    let module = Object::new(ctx.clone())?;
    let cwd = cwd.to_string();

    module.set("sep", "/")?;
    module.set("delimiter", ":")?;
    module.set(
        "join",
        Function::new(ctx.clone(), |parts: Rest<String>| join(&parts.0))?,
    )?;
    let resolve_cwd = cwd.clone();
    module.set(
        "resolve",
        Function::new(ctx.clone(), move |parts: Rest<String>| {
            resolve(&resolve_cwd, &parts.0)
        })?,
    )?;
    module.set("normalize", Function::new(ctx.clone(), |p: String| normalize(&p))?)?;
    module.set("dirname", Function::new(ctx.clone(), |p: String| dirname(&p))?)?;
    module.set(
        "basename",
        Function::new(ctx.clone(), |p: String, ext: Opt<String>| {
            basename(&p, ext.0.as_deref())
        })?,
    )?;
    module.set("extname", Function::new(ctx.clone(), |p: String| extname(&p))?)?;
    module.set(
        "isAbsolute",
        Function::new(ctx.clone(), |p: String| p.starts_with('/'))?,
    )?;
    module.set(
        "relative",
        Function::new(ctx.clone(), move |from: String, to: String| {
            relative(&cwd, &from, &to)
        })?,
    )?;

    let posix = module.clone();
    module.set("posix", posix)?;
    Ok(module)
}

fn os_module<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
    let module = Object::new(ctx.clone())?;
    let eol = if cfg!(windows) { "\r\n" } else { "\n" };
    module.set("EOL", eol)?;
    module.set("platform", Function::new(ctx.clone(), || node_platform())?)?;
    module.set("arch", Function::new(ctx.clone(), || node_arch())?)?;
    module.set(
        "homedir",
        Function::new(ctx.clone(), || {
            dirs::home_dir()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default()
        })?,
    )?;
    module.set(
        "tmpdir",
        Function::new(ctx.clone(), || {
            std::env::temp_dir().to_string_lossy().into_owned()
        })?,
    )?;
    Ok(module)
}

pub fn normalize(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let absolute = path.starts_with('/');
    let trailing = path.ends_with('/');

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().map_or(false, |s| *s != "..") {
                    segments.pop();
                } else if !absolute {
                    segments.push("..");
                }
            }
            other => segments.push(other),
        }
    }

    let mut out = segments.join("/");
    if absolute {
        out.insert(0, '/');
    }
    if out.is_empty() {
        return ".".to_string();
    }
    if trailing && out != "/" {
        out.push('/');
    }
    out
}

pub fn join(parts: &[String]) -> String {
    let joined = parts
        .iter()
        .filter(|p| !p.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("/");
    normalize(&joined)
}

pub fn resolve(cwd: &str, parts: &[String]) -> String {
    let mut resolved = String::new();
    for part in parts.iter().rev().filter(|p| !p.is_empty()) {
        resolved = if resolved.is_empty() {
            part.clone()
        } else {
            format!("{}/{}", part, resolved)
        };
        if part.starts_with('/') {
            break;
        }
    }
    if !resolved.starts_with('/') {
        resolved = if resolved.is_empty() {
            cwd.to_string()
        } else {
            format!("{}/{}", cwd, resolved)
        };
    }

    let normalized = normalize(&resolved);
    if normalized.len() > 1 {
        normalized.trim_end_matches('/').to_string()
    } else {
        normalized
    }
}

pub fn dirname(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return if path.starts_with('/') { "/" } else { "." }.to_string();
    }
    match trimmed.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => trimmed[..idx].trim_end_matches('/').to_string(),
        None => ".".to_string(),
    }
}

pub fn basename(path: &str, ext: Option<&str>) -> String {
    let trimmed = path.trim_end_matches('/');
    let base = trimmed.rsplit('/').next().unwrap_or(trimmed);
    match ext {
        Some(ext) if !ext.is_empty() && base != ext && base.ends_with(ext) => {
            base[..base.len() - ext.len()].to_string()
        }
        _ => base.to_string(),
    }
}

pub fn extname(path: &str) -> String {
    let base = basename(path, None);
    match base.rfind('.') {
        Some(idx) if idx > 0 => base[idx..].to_string(),
        _ => String::new(),
    }
}

pub fn relative(cwd: &str, from: &str, to: &str) -> String {
    let from = resolve(cwd, &[from.to_string()]);
    let to = resolve(cwd, &[to.to_string()]);
    let from_parts: Vec<&str> = from.split('/').filter(|s| !s.is_empty()).collect();
    let to_parts: Vec<&str> = to.split('/').filter(|s| !s.is_empty()).collect();

    let common = from_parts
        .iter()
        .zip(&to_parts)
        .take_while(|(a, b)| a == b)
        .count();

    let mut out: Vec<&str> = vec![".."; from_parts.len() - common];
    out.extend(&to_parts[common..]);
    out.join("/")
}
