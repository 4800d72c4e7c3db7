use std::env;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use libloading::Library;

use crate::agent::TagAgent;
use crate::heap::ObjRef;

const OBJECT_TAGGER_LIB_NAME: &str = "heapscope_object_tagger";

/// Installed layout: the library sits next to the binary.
const RESOURCES_NATIVE_PATH: &str = "resources/native";
/// Development layout: per-platform build output under the source tree.
const DEV_NATIVE_PATH: &str = "native";

const HOME_ENV: &str = "HEAPSCOPE_HOME";

pub fn platform_lib_name(base: &str) -> String {
    if cfg!(target_os = "windows") {
        format!("{}.dll", base)
    } else if cfg!(target_os = "macos") {
        format!("lib{}.dylib", base)
    } else {
        format!("lib{}.so", base)
    }
}

fn platform_dir_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "win"
    } else if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
        "mac_arm"
    } else if cfg!(target_os = "macos") {
        "mac"
    } else {
        "linux"
    }
}

fn home_path() -> Result<PathBuf> {
    if let Ok(home) = env::var(HOME_ENV) {
        return Ok(PathBuf::from(home));
    }
    let exe = env::current_exe().context("cannot locate current executable")?;
    Ok(exe
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(".")))
}

fn lib_location() -> Result<PathBuf> {
    let lib_name = platform_lib_name(OBJECT_TAGGER_LIB_NAME);
    let home = home_path()?;

    let installed = home.join(RESOURCES_NATIVE_PATH).join(&lib_name);
    if installed.exists() {
        return Ok(installed);
    }
    let dev = home
        .join(DEV_NATIVE_PATH)
        .join(platform_dir_name())
        .join(&lib_name);
    if dev.exists() {
        return Ok(dev);
    }
    bail!(
        "object tagger library {} not found under {}",
        lib_name,
        home.display()
    );
}

/// Shim over the loaded tagging agent. The function pointers stay valid for
/// as long as the library handle is held, which is until process exit.
pub struct NativeTagAgent {
    _lib: Library,
    get_tag: unsafe extern "C" fn(u64) -> u64,
    set_tag: unsafe extern "C" fn(u64, u64),
    size_of: unsafe extern "C" fn(u64) -> u64,
    can_tag: unsafe extern "C" fn() -> u8,
}

pub(crate) fn load_native_agent() -> Result<NativeTagAgent> {
    let location = lib_location()?;
    info!("Attaching object tagging agent from {}", location.display());
    unsafe {
        let lib = Library::new(&location)
            .with_context(|| format!("failed to load {}", location.display()))?;
        let get_tag = *lib.get(b"heapscope_get_object_tag\0")?;
        let set_tag = *lib.get(b"heapscope_set_object_tag\0")?;
        let size_of = *lib.get(b"heapscope_get_object_size\0")?;
        let can_tag = *lib.get(b"heapscope_can_tag_objects\0")?;
        Ok(NativeTagAgent {
            _lib: lib,
            get_tag,
            set_tag,
            size_of,
            can_tag,
        })
    }
}

impl TagAgent for NativeTagAgent {
    fn get_tag(&self, o: ObjRef) -> u64 {
        unsafe { (self.get_tag)(o.raw()) }
    }

    fn set_tag(&self, o: ObjRef, tag: u64) {
        unsafe { (self.set_tag)(o.raw(), tag) }
    }

    fn size_of(&self, o: ObjRef) -> u64 {
        unsafe { (self.size_of)(o.raw()) }
    }

    fn can_tag(&self) -> bool {
        unsafe { (self.can_tag)() != 0 }
    }
}
