//! Forwards every export of the proxied module to the renamed original, so
//! the host can load this DLL in its place.

/// The proxied module, without its extension.
const ORIGINAL: &str = "Lossless_original";

const FORWARDED_EXPORTS: &[&str] = &[
    "Activate",
    "ApplySettings",
    "GetAdapterNames",
    "GetDisplayNames",
    "GetDwmRefreshRate",
    "GetForegroundWindowEx",
    "Init",
    "IsWindowsBuildAtLeast",
    "SetDriverSettings",
    "SetWindowsSettings",
    "UnInit",
];

fn main() {
    println!("cargo::rerun-if-changed=build.rs");

    // Forwarders are an MSVC linker feature.
    if std::env::var("CARGO_CFG_TARGET_ENV").as_deref() != Ok("msvc") {
        return;
    }
    for export in FORWARDED_EXPORTS {
        println!("cargo::rustc-cdylib-link-arg=/EXPORT:{export}={ORIGINAL}.{export}");
    }
}
