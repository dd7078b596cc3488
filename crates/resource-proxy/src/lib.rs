//! A stand-in for Lossless Scaling's frame generation module that lets addons
//! replace the shaders it loads from its resources.

#[cfg(windows)]
mod entry;
#[cfg(any(windows, test))]
mod target;
