use std::fmt::Write as _;
use std::num::NonZeroU8;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{anyhow, bail, Context, Result};
use log::warn;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;

use crate::cfg::CfgRegistry;

/// Pointer width of a target, in bits.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    TryFromPrimitive,
    IntoPrimitive,
)]
#[repr(u32)]
#[serde(into = "u32")]
pub enum PointerBits {
    P16 = 16,
    P32 = 32,
    P64 = 64,
}

impl PointerBits {
    pub fn bits(self) -> u32 {
        self.into()
    }

    pub fn bytes(self) -> u64 {
        u64::from(self.bits() / 8)
    }
}

/// Which primitive widths the architecture supports atomic access to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArchAtomics {
    pub u8: bool,
    pub u16: bool,
    pub u32: bool,
    pub u64: bool,
    pub ptr: bool,
}

/// Natural alignment of each primitive, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArchAlignments {
    pub u16: NonZeroU8,
    pub u32: NonZeroU8,
    pub u64: NonZeroU8,
    pub u128: NonZeroU8,
    pub f32: NonZeroU8,
    pub f64: NonZeroU8,
    pub ptr: NonZeroU8,
}

impl ArchAlignments {
    fn new(
        u16: u8,
        u32: u8,
        u64: u8,
        u128: u8,
        f32: u8,
        f64: u8,
        ptr: u8,
    ) -> Self {
        Self {
            u16: nz(u16),
            u32: nz(u32),
            u64: nz(u64),
            u128: nz(u128),
            f32: nz(f32),
            f64: nz(f64),
            ptr: nz(ptr),
        }
    }
}

fn nz(v: u8) -> NonZeroU8 {
    NonZeroU8::new(v).expect("alignment constant must be nonzero")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetArch {
    pub name: String,
    pub pointer_bits: PointerBits,
    pub big_endian: bool,
    pub atomics: ArchAtomics,
    pub alignments: ArchAlignments,
}

impl Default for TargetArch {
    fn default() -> Self {
        Self {
            name: String::new(),
            pointer_bits: PointerBits::P32,
            big_endian: false,
            atomics: ArchAtomics::default(),
            alignments: ArchAlignments::new(1, 1, 1, 1, 1, 1, 1),
        }
    }
}

impl TargetArch {
    pub fn x86_64() -> Self {
        Self {
            name: "x86_64".to_owned(),
            pointer_bits: PointerBits::P64,
            big_endian: false,
            atomics: ArchAtomics {
                u8: true,
                u16: false,
                u32: true,
                u64: true,
                ptr: true,
            },
            alignments: ArchAlignments::new(2, 4, 8, 16, 4, 8, 8),
        }
    }

    pub fn x86() -> Self {
        Self {
            name: "x86".to_owned(),
            pointer_bits: PointerBits::P32,
            big_endian: false,
            atomics: ArchAtomics {
                u8: true,
                u16: false,
                u32: true,
                u64: false,
                ptr: true,
            },
            // u64 and u128 drop to u32's alignment, and f64 is
            // 4-byte aligned.
            alignments: ArchAlignments::new(2, 4, 4, 4, 4, 4, 4),
        }
    }

    pub fn arm32() -> Self {
        Self {
            name: "arm".to_owned(),
            pointer_bits: PointerBits::P32,
            big_endian: false,
            atomics: ArchAtomics {
                u8: true,
                u16: false,
                u32: true,
                u64: false,
                ptr: true,
            },
            alignments: ArchAlignments::new(2, 4, 8, 16, 4, 8, 4),
        }
    }

    pub fn arm64() -> Self {
        Self {
            name: "aarch64".to_owned(),
            pointer_bits: PointerBits::P64,
            big_endian: false,
            atomics: ArchAtomics {
                u8: true,
                u16: true,
                u32: true,
                u64: true,
                ptr: true,
            },
            alignments: ArchAlignments::new(2, 4, 8, 16, 4, 8, 8),
        }
    }

    pub fn m68k() -> Self {
        Self {
            name: "m68k".to_owned(),
            pointer_bits: PointerBits::P32,
            big_endian: true,
            atomics: ArchAtomics {
                u8: true,
                u16: false,
                u32: true,
                u64: false,
                ptr: true,
            },
            alignments: ArchAlignments::new(2, 2, 2, 2, 2, 2, 2),
        }
    }

    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            "x86" => Some(Self::x86()),
            "x86_64" => Some(Self::x86_64()),
            "arm" => Some(Self::arm32()),
            "aarch64" => Some(Self::arm64()),
            "m68k" => Some(Self::m68k()),
            _ => None,
        }
    }

    pub fn pointer_bytes(&self) -> u64 {
        self.pointer_bits.bytes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CodegenMode {
    Gnu11,
    Msvc,
}

impl CodegenMode {
    pub fn name(self) -> &'static str {
        match self {
            CodegenMode::Gnu11 => "gnu",
            CodegenMode::Msvc => "msvc",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "gnu" => Some(CodegenMode::Gnu11),
            "msvc" => Some(CodegenMode::Msvc),
            _ => None,
        }
    }
}

/// C backend description: which compiler is driven and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendC {
    pub codegen_mode: CodegenMode,
    /// 128-bit integers lowered to a two-word struct.
    pub emulated_i128: bool,
    pub c_compiler: String,
    pub compiler_opts: Vec<String>,
    pub linker_opts: Vec<String>,
}

impl Default for BackendC {
    fn default() -> Self {
        Self {
            codegen_mode: CodegenMode::Gnu11,
            emulated_i128: false,
            c_compiler: String::new(),
            compiler_opts: Vec::new(),
            linker_opts: Vec::new(),
        }
    }
}

/// Everything the compiler knows about the compilation target.
/// Installed once per run and read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TargetSpec {
    pub family: String,
    pub os_name: String,
    pub env_name: String,
    pub backend_c: BackendC,
    pub arch: TargetArch,
}

/// Names accepted by [`TargetSpec::from_name`].
pub const BUILTIN_NAMES: &[&str] = &[
    "i586-linux-gnu",
    "x86_64-linux-gnu",
    "arm-linux-gnu",
    "aarch64-linux-gnu",
    "m68k-linux-gnu",
    "i586-pc-windows-gnu",
    "x86_64-pc-windows-gnu",
    "x86-pc-windows-msvc",
    "x86_64-pc-windows-msvc",
    "i686-unknown-freebsd",
    "x86_64-unknown-freebsd",
    "arm-unknown-freebsd",
    "aarch64-unknown-freebsd",
    "x86_64-unknown-netbsd",
    "i686-unknown-openbsd",
    "x86_64-unknown-openbsd",
    "arm-unknown-openbsd",
    "aarch64-unknown-openbsd",
    "x86_64-unknown-dragonfly",
    "x86_64-apple-macosx",
    "arm-unknown-haiku",
    "x86_64-unknown-haiku",
];

impl TargetSpec {
    fn new_gnu(
        family: &str,
        os: &str,
        c_compiler: &str,
        emulated_i128: bool,
        arch: TargetArch,
    ) -> Self {
        Self {
            family: family.to_owned(),
            os_name: os.to_owned(),
            env_name: "gnu".to_owned(),
            backend_c: BackendC {
                codegen_mode: CodegenMode::Gnu11,
                emulated_i128,
                c_compiler: c_compiler.to_owned(),
                compiler_opts: vec![
                    "-ffunction-sections".to_owned(),
                    "-pthread".to_owned(),
                ],
                linker_opts: vec!["-Wl,--gc-sections".to_owned()],
            },
            arch,
        }
    }

    fn new_bare(
        family: &str,
        os: &str,
        env: &str,
        mode: CodegenMode,
        c_compiler: &str,
        emulated_i128: bool,
        arch: TargetArch,
    ) -> Self {
        Self {
            family: family.to_owned(),
            os_name: os.to_owned(),
            env_name: env.to_owned(),
            backend_c: BackendC {
                codegen_mode: mode,
                emulated_i128,
                c_compiler: c_compiler.to_owned(),
                compiler_opts: Vec::new(),
                linker_opts: Vec::new(),
            },
            arch,
        }
    }

    /// Look up a built-in target triple. Unknown names are an error.
    pub fn from_name(name: &str) -> Result<Self> {
        use CodegenMode::Msvc;
        let rv = match name {
            "i586-linux-gnu" => {
                Self::new_gnu("unix", "linux", name, true, TargetArch::x86())
            }
            "x86_64-linux-gnu" => Self::new_gnu(
                "unix",
                "linux",
                name,
                false,
                TargetArch::x86_64(),
            ),
            "arm-linux-gnu" => Self::new_gnu(
                "unix",
                "linux",
                "arm-elf-eabi",
                true,
                TargetArch::arm32(),
            ),
            "aarch64-linux-gnu" => Self::new_gnu(
                "unix",
                "linux",
                name,
                false,
                TargetArch::arm64(),
            ),
            "m68k-linux-gnu" => {
                Self::new_gnu("unix", "linux", name, true, TargetArch::m68k())
            }
            "i586-pc-windows-gnu" => Self::new_gnu(
                "windows",
                "windows",
                "mingw32",
                true,
                TargetArch::x86(),
            ),
            "x86_64-pc-windows-gnu" => Self::new_gnu(
                "windows",
                "windows",
                "x86_64-w64-mingw32",
                false,
                TargetArch::x86_64(),
            ),
            "x86-pc-windows-msvc" => Self::new_bare(
                "windows",
                "windows",
                "msvc",
                Msvc,
                "x86",
                true,
                TargetArch::x86(),
            ),
            "x86_64-pc-windows-msvc" => Self::new_bare(
                "windows",
                "windows",
                "msvc",
                Msvc,
                "amd64",
                true,
                TargetArch::x86_64(),
            ),
            "i686-unknown-freebsd" => {
                Self::new_gnu("unix", "freebsd", name, true, TargetArch::x86())
            }
            "x86_64-unknown-freebsd" => Self::new_gnu(
                "unix",
                "freebsd",
                name,
                false,
                TargetArch::x86_64(),
            ),
            "arm-unknown-freebsd" => Self::new_gnu(
                "unix",
                "freebsd",
                name,
                true,
                TargetArch::arm32(),
            ),
            "aarch64-unknown-freebsd" => Self::new_gnu(
                "unix",
                "freebsd",
                name,
                false,
                TargetArch::arm64(),
            ),
            "x86_64-unknown-netbsd" => Self::new_gnu(
                "unix",
                "netbsd",
                name,
                false,
                TargetArch::x86_64(),
            ),
            "i686-unknown-openbsd" => {
                Self::new_gnu("unix", "openbsd", name, true, TargetArch::x86())
            }
            "x86_64-unknown-openbsd" => Self::new_gnu(
                "unix",
                "openbsd",
                name,
                false,
                TargetArch::x86_64(),
            ),
            "arm-unknown-openbsd" => Self::new_gnu(
                "unix",
                "openbsd",
                name,
                true,
                TargetArch::arm32(),
            ),
            "aarch64-unknown-openbsd" => Self::new_gnu(
                "unix",
                "openbsd",
                name,
                false,
                TargetArch::arm64(),
            ),
            "x86_64-unknown-dragonfly" => Self::new_gnu(
                "unix",
                "dragonfly",
                name,
                false,
                TargetArch::x86_64(),
            ),
            // Mach-O binaries don't support the section flags the GNU
            // defaults rely on.
            "x86_64-apple-macosx" => Self::new_bare(
                "unix",
                "macos",
                "gnu",
                CodegenMode::Gnu11,
                "x86_64-apple-darwin",
                false,
                TargetArch::x86_64(),
            ),
            "arm-unknown-haiku" => Self::new_bare(
                "unix",
                "haiku",
                "gnu",
                CodegenMode::Gnu11,
                name,
                true,
                TargetArch::arm32(),
            ),
            "x86_64-unknown-haiku" => Self::new_bare(
                "unix",
                "haiku",
                "gnu",
                CodegenMode::Gnu11,
                name,
                false,
                TargetArch::x86_64(),
            ),
            _ => bail!("unknown target name {name:?}"),
        };
        Ok(rv)
    }

    /// A name containing a path separator loads a specification file,
    /// anything else selects a built-in triple.
    pub fn load(name_or_path: &str) -> Result<Self> {
        if name_or_path.contains('/') || name_or_path.contains('\\') {
            Self::from_file(Path::new(name_or_path))
        } else {
            Self::from_name(name_or_path)
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading target spec {}", path.display()))?;
        Self::parse(&text)
            .with_context(|| format!("loading target spec {}", path.display()))
    }

    /// Parse the specification document. Unknown keys only warn so that
    /// older compilers keep accepting newer files; type errors and
    /// unknown names are fatal.
    pub fn parse(text: &str) -> Result<Self> {
        let root: toml::Value =
            text.parse().context("parsing target specification")?;
        let Some(root) = root.as_table() else {
            bail!("target specification must be a table");
        };

        let mut rv = TargetSpec::default();

        if let Some(target) = root.get("target") {
            let tbl = as_table(target, "target")?;
            for (key, value) in tbl {
                match key.as_str() {
                    "family" => {
                        rv.family = as_str(value, "target.family")?.to_owned();
                    }
                    "os-name" => {
                        rv.os_name =
                            as_str(value, "target.os-name")?.to_owned();
                    }
                    "env-name" => {
                        rv.env_name =
                            as_str(value, "target.env-name")?.to_owned();
                    }
                    "arch" => {
                        let name = as_str(value, "target.arch")?;
                        rv.arch = TargetArch::builtin(name).ok_or_else(
                            || anyhow!("unknown architecture name {name:?}"),
                        )?;
                    }
                    other => {
                        warn!("unknown configuration item target.{other}");
                    }
                }
            }
        }

        if let Some(backend) = root.get("backend") {
            let tbl = as_table(backend, "backend")?;
            for (key, value) in tbl {
                match key.as_str() {
                    "c" => parse_backend_c(value, &mut rv.backend_c)?,
                    other => {
                        warn!("unknown configuration item backend.{other}");
                    }
                }
            }
        }

        if let Some(arch) = root.get("arch") {
            parse_arch(arch, &mut rv.arch)?;
        }

        for key in root.keys() {
            if !matches!(key.as_str(), "target" | "backend" | "arch") {
                warn!("unknown configuration item {key}");
            }
        }

        if rv.arch.name.is_empty() {
            bail!("architecture not specified");
        }
        Ok(rv)
    }

    /// Write the specification in the same document format the loader
    /// accepts; loading the output reproduces an equal spec.
    pub fn to_document(&self) -> String {
        let mut out = String::new();
        let b = &self.backend_c;
        let a = &self.arch;
        let _ = writeln!(out, "[target]");
        let _ = writeln!(out, "family = \"{}\"", self.family);
        let _ = writeln!(out, "os-name = \"{}\"", self.os_name);
        let _ = writeln!(out, "env-name = \"{}\"", self.env_name);
        let _ = writeln!(out);
        let _ = writeln!(out, "[backend.c]");
        let _ = writeln!(out, "variant = \"{}\"", b.codegen_mode.name());
        let _ = writeln!(out, "target = \"{}\"", b.c_compiler);
        let _ = writeln!(out, "emulate-i128 = {}", b.emulated_i128);
        let _ = writeln!(
            out,
            "compiler-opts = [{}]",
            string_list(&b.compiler_opts)
        );
        let _ =
            writeln!(out, "linker-opts = [{}]", string_list(&b.linker_opts));
        let _ = writeln!(out);
        let _ = writeln!(out, "[arch]");
        let _ = writeln!(out, "name = \"{}\"", a.name);
        let _ = writeln!(out, "pointer-bits = {}", a.pointer_bits.bits());
        let _ = writeln!(out, "is-big-endian = {}", a.big_endian);
        let _ = writeln!(out, "has-atomic-u8 = {}", a.atomics.u8);
        let _ = writeln!(out, "has-atomic-u16 = {}", a.atomics.u16);
        let _ = writeln!(out, "has-atomic-u32 = {}", a.atomics.u32);
        let _ = writeln!(out, "has-atomic-u64 = {}", a.atomics.u64);
        let _ = writeln!(out, "has-atomic-ptr = {}", a.atomics.ptr);
        let al = &a.alignments;
        let _ = writeln!(
            out,
            "alignments = {{ u16 = {}, u32 = {}, u64 = {}, u128 = {}, \
             f32 = {}, f64 = {}, ptr = {} }}",
            al.u16, al.u32, al.u64, al.u128, al.f32, al.f64, al.ptr,
        );
        out
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_document()).with_context(|| {
            format!("writing target spec {}", path.display())
        })
    }

    /// Publish the derived `cfg` flags and values for this target.
    pub fn apply_cfg(&self, cfg: &mut CfgRegistry) {
        match self.family.as_str() {
            "unix" => cfg.set_flag("unix"),
            "windows" => cfg.set_flag("windows"),
            _ => {}
        }
        cfg.set_value("target_family", &self.family);

        match self.os_name.as_str() {
            "linux" => {
                cfg.set_flag("linux");
                cfg.set_value_default("target_vendor", "gnu");
            }
            os @ ("freebsd" | "netbsd" | "openbsd" | "dragonfly") => {
                cfg.set_flag(os);
                cfg.set_value_default("target_vendor", "unknown");
            }
            _ => {}
        }
        cfg.set_value_default("target_vendor", "");

        cfg.set_value("target_env", &self.env_name);
        cfg.set_value("target_os", &self.os_name);
        cfg.set_value(
            "target_pointer_width",
            &self.arch.pointer_bits.bits().to_string(),
        );
        cfg.set_value(
            "target_endian",
            if self.arch.big_endian { "big" } else { "little" },
        );
        cfg.set_value("target_arch", &self.arch.name);

        let at = &self.arch.atomics;
        if at.u8 {
            cfg.set_value("target_has_atomic", "8");
        }
        if at.u16 {
            cfg.set_value("target_has_atomic", "16");
        }
        if at.u32 {
            cfg.set_value("target_has_atomic", "32");
        }
        if at.u64 {
            cfg.set_value("target_has_atomic", "64");
        }
        if at.ptr {
            cfg.set_value("target_has_atomic", "ptr");
            cfg.set_value("target_has_atomic", "cas");
        }
    }
}

fn string_list(items: &[String]) -> String {
    items
        .iter()
        .map(|s| format!("\"{s}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

fn as_table<'a>(
    value: &'a toml::Value,
    key: &str,
) -> Result<&'a toml::map::Map<String, toml::Value>> {
    value
        .as_table()
        .ok_or_else(|| anyhow!("expected a table for `{key}`"))
}

fn as_str<'a>(value: &'a toml::Value, key: &str) -> Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| anyhow!("expected a string for `{key}`"))
}

fn as_bool(value: &toml::Value, key: &str) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| anyhow!("expected a boolean for `{key}`"))
}

fn as_int(value: &toml::Value, key: &str) -> Result<i64> {
    value
        .as_integer()
        .ok_or_else(|| anyhow!("expected an integer for `{key}`"))
}

fn as_string_list(value: &toml::Value, key: &str) -> Result<Vec<String>> {
    let list = value
        .as_array()
        .ok_or_else(|| anyhow!("expected a string list for `{key}`"))?;
    list.iter()
        .map(|v| as_str(v, key).map(str::to_owned))
        .collect()
}

fn as_align(value: &toml::Value, key: &str) -> Result<NonZeroU8> {
    let raw = as_int(value, key)?;
    let raw = u8::try_from(raw)
        .map_err(|_| anyhow!("alignment out of range for `{key}`: {raw}"))?;
    NonZeroU8::new(raw)
        .ok_or_else(|| anyhow!("alignment for `{key}` must be nonzero"))
}

fn parse_backend_c(value: &toml::Value, out: &mut BackendC) -> Result<()> {
    let tbl = as_table(value, "backend.c")?;
    for (key, value) in tbl {
        match key.as_str() {
            "variant" => {
                let name = as_str(value, "backend.c.variant")?;
                out.codegen_mode = CodegenMode::from_name(name)
                    .ok_or_else(|| {
                        anyhow!("unknown C variant name {name:?}")
                    })?;
            }
            "target" => {
                out.c_compiler =
                    as_str(value, "backend.c.target")?.to_owned();
            }
            "emulate-i128" => {
                out.emulated_i128 =
                    as_bool(value, "backend.c.emulate-i128")?;
            }
            "compiler-opts" => {
                out.compiler_opts =
                    as_string_list(value, "backend.c.compiler-opts")?;
            }
            "linker-opts" => {
                out.linker_opts =
                    as_string_list(value, "backend.c.linker-opts")?;
            }
            other => warn!("unknown field backend.c.{other}"),
        }
    }
    Ok(())
}

fn parse_arch(value: &toml::Value, out: &mut TargetArch) -> Result<()> {
    let tbl = as_table(value, "arch")?;
    for (key, value) in tbl {
        match key.as_str() {
            "name" => {
                if !out.name.is_empty() {
                    bail!("architecture already specified as {:?}", out.name);
                }
                out.name = as_str(value, "arch.name")?.to_owned();
            }
            "pointer-bits" => {
                let raw = as_int(value, "arch.pointer-bits")?;
                let raw = u32::try_from(raw).map_err(|_| {
                    anyhow!("invalid pointer width: {raw}")
                })?;
                out.pointer_bits = PointerBits::try_from(raw)
                    .map_err(|_| anyhow!("invalid pointer width: {raw}"))?;
            }
            "is-big-endian" => {
                out.big_endian = as_bool(value, "arch.is-big-endian")?;
            }
            "has-atomic-u8" => {
                out.atomics.u8 = as_bool(value, "arch.has-atomic-u8")?;
            }
            "has-atomic-u16" => {
                out.atomics.u16 = as_bool(value, "arch.has-atomic-u16")?;
            }
            "has-atomic-u32" => {
                out.atomics.u32 = as_bool(value, "arch.has-atomic-u32")?;
            }
            "has-atomic-u64" => {
                out.atomics.u64 = as_bool(value, "arch.has-atomic-u64")?;
            }
            "has-atomic-ptr" => {
                out.atomics.ptr = as_bool(value, "arch.has-atomic-ptr")?;
            }
            "alignments" => {
                let tbl = as_table(value, "arch.alignments")?;
                let al = &mut out.alignments;
                for (key, value) in tbl {
                    match key.as_str() {
                        "u16" => {
                            al.u16 = as_align(value, "arch.alignments.u16")?;
                        }
                        "u32" => {
                            al.u32 = as_align(value, "arch.alignments.u32")?;
                        }
                        "u64" => {
                            al.u64 = as_align(value, "arch.alignments.u64")?;
                        }
                        "u128" => {
                            al.u128 =
                                as_align(value, "arch.alignments.u128")?;
                        }
                        "f32" => {
                            al.f32 = as_align(value, "arch.alignments.f32")?;
                        }
                        "f64" => {
                            al.f64 = as_align(value, "arch.alignments.f64")?;
                        }
                        "ptr" => {
                            al.ptr = as_align(value, "arch.alignments.ptr")?;
                        }
                        other => warn!("unknown field arch.alignments.{other}"),
                    }
                }
            }
            other => warn!("unknown field arch.{other}"),
        }
    }
    Ok(())
}

static CURRENT: OnceLock<TargetSpec> = OnceLock::new();

/// Install the process-wide target. May only happen once per run; the
/// derived `cfg` flags are published to the given registry.
pub fn set_current(
    name_or_path: &str,
    cfg: &mut CfgRegistry,
) -> Result<&'static TargetSpec> {
    let spec = TargetSpec::load(name_or_path)?;
    CURRENT
        .set(spec)
        .map_err(|_| anyhow!("target already configured for this run"))?;
    let spec = CURRENT.get().expect("target just installed");
    spec.apply_cfg(cfg);
    Ok(spec)
}

/// The installed target, if [`set_current`] has run.
pub fn current() -> Option<&'static TargetSpec> {
    CURRENT.get()
}

pub fn export_current(path: &Path) -> Result<()> {
    current()
        .ok_or_else(|| anyhow!("no target configured"))?
        .save_to_file(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::CfgRegistry;
    use rstest::rstest;

    #[test]
    fn builtin_linux_targets() {
        let spec = TargetSpec::from_name("x86_64-linux-gnu").unwrap();
        assert_eq!(spec.family, "unix");
        assert_eq!(spec.os_name, "linux");
        assert_eq!(spec.arch.name, "x86_64");
        assert_eq!(spec.arch.pointer_bits, PointerBits::P64);
        assert!(!spec.backend_c.emulated_i128);
        assert_eq!(
            spec.backend_c.compiler_opts,
            ["-ffunction-sections", "-pthread"]
        );

        let spec = TargetSpec::from_name("i586-linux-gnu").unwrap();
        assert_eq!(spec.arch.name, "x86");
        assert!(spec.backend_c.emulated_i128);
        assert_eq!(spec.arch.alignments.u64.get(), 4);
    }

    #[test]
    fn builtin_msvc_and_big_endian() {
        let spec = TargetSpec::from_name("x86_64-pc-windows-msvc").unwrap();
        assert_eq!(spec.backend_c.codegen_mode, CodegenMode::Msvc);
        assert_eq!(spec.backend_c.c_compiler, "amd64");
        assert!(spec.backend_c.compiler_opts.is_empty());

        let spec = TargetSpec::from_name("m68k-linux-gnu").unwrap();
        assert!(spec.arch.big_endian);
        assert_eq!(spec.arch.alignments.ptr.get(), 2);
    }

    #[test]
    fn every_builtin_name_resolves() {
        for name in BUILTIN_NAMES {
            let spec = TargetSpec::from_name(name).unwrap();
            assert!(!spec.arch.name.is_empty(), "{name}");
        }
    }

    #[test]
    fn unknown_target_is_fatal() {
        assert!(TargetSpec::from_name("riscv64-linux-gnu").is_err());
    }

    #[rstest]
    #[case("x86_64-linux-gnu")]
    #[case("i586-pc-windows-gnu")]
    #[case("x86-pc-windows-msvc")]
    #[case("m68k-linux-gnu")]
    #[case("x86_64-apple-macosx")]
    fn document_round_trip(#[case] name: &str) {
        let spec = TargetSpec::from_name(name).unwrap();
        let text = spec.to_document();
        let reloaded = TargetSpec::parse(&text).unwrap();
        assert_eq!(spec, reloaded, "{name}:\n{text}");
    }

    #[test]
    fn parse_overrides_builtin_arch() {
        let text = "\
            [target]\n\
            family = \"unix\"\n\
            os-name = \"linux\"\n\
            env-name = \"gnu\"\n\
            arch = \"x86_64\"\n\
            [arch]\n\
            is-big-endian = true\n\
            alignments = { u64 = 4 }\n\
        ";
        let spec = TargetSpec::parse(text).unwrap();
        assert_eq!(spec.arch.name, "x86_64");
        assert!(spec.arch.big_endian);
        assert_eq!(spec.arch.alignments.u64.get(), 4);
        // Untouched fields keep the builtin values.
        assert_eq!(spec.arch.alignments.u128.get(), 16);
    }

    #[test]
    fn parse_rejects_bad_input() {
        // No architecture at all.
        assert!(TargetSpec::parse("[target]\nfamily = \"unix\"\n").is_err());
        // Unknown architecture name.
        assert!(TargetSpec::parse(
            "[target]\narch = \"sparc\"\n"
        )
        .is_err());
        // Unknown C variant.
        assert!(TargetSpec::parse(
            "[backend.c]\nvariant = \"clang\"\n[arch]\nname = \"x86\"\n"
        )
        .is_err());
        // Arch named twice.
        assert!(TargetSpec::parse(
            "[target]\narch = \"x86\"\n[arch]\nname = \"x86\"\n"
        )
        .is_err());
        // Type error.
        assert!(TargetSpec::parse(
            "[arch]\nname = \"x86\"\npointer-bits = \"32\"\n"
        )
        .is_err());
        // Invalid pointer width.
        assert!(TargetSpec::parse(
            "[arch]\nname = \"x86\"\npointer-bits = 48\n"
        )
        .is_err());
    }

    #[test]
    fn cfg_publication() {
        let spec = TargetSpec::from_name("x86_64-linux-gnu").unwrap();
        let mut cfg = CfgRegistry::new();
        spec.apply_cfg(&mut cfg);
        assert!(cfg.is_flag_set("unix"));
        assert!(cfg.is_flag_set("linux"));
        assert!(!cfg.is_flag_set("windows"));
        assert!(cfg.check_value("target_family", "unix"));
        assert!(cfg.check_value("target_vendor", "gnu"));
        assert!(cfg.check_value("target_os", "linux"));
        assert!(cfg.check_value("target_pointer_width", "64"));
        assert!(cfg.check_value("target_endian", "little"));
        assert!(cfg.check_value("target_arch", "x86_64"));
        assert_eq!(
            cfg.values_of("target_has_atomic"),
            ["8", "32", "64", "ptr", "cas"]
        );

        let spec = TargetSpec::from_name("x86_64-unknown-freebsd").unwrap();
        let mut cfg = CfgRegistry::new();
        spec.apply_cfg(&mut cfg);
        assert!(cfg.is_flag_set("freebsd"));
        assert!(cfg.check_value("target_vendor", "unknown"));
    }

    #[test]
    fn install_and_export_current() {
        let mut cfg = CfgRegistry::new();
        let spec = set_current("aarch64-linux-gnu", &mut cfg).unwrap();
        assert_eq!(spec.arch.name, "aarch64");
        assert!(cfg.is_flag_set("linux"));
        assert!(current().is_some());
        // The target is installed once per run.
        assert!(set_current("i586-linux-gnu", &mut cfg).is_err());

        let path = std::env::temp_dir().join("tyrepr-export-test.toml");
        export_current(&path).unwrap();
        let reloaded = TargetSpec::from_file(&path).unwrap();
        assert_eq!(&reloaded, current().unwrap());
        let _ = std::fs::remove_file(&path);
    }
}
