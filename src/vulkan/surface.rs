//! Presentation surfaces and the live drawable size behind them.
//!
//! The renderer never talks to a window directly. It asks a
//! [`SurfaceProvider`] for a `VkSurfaceKHR` once at startup and asks an
//! [`ExtentSource`] for the current size whenever the swapchain is rebuilt.

use std::ffi::c_char;
use std::sync::Arc;

use ash::{khr::surface, vk, Entry, Instance};
#[cfg(target_os = "linux")]
use raw_window_handle::RawDisplayHandle;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawWindowHandle};

use crate::{RenderError, Result};

/// Reports the current drawable size of the presentation surface.
///
/// A zero width or height means the surface is minimized and nothing can be
/// presented until it grows again.
pub trait ExtentSource {
    fn current_extent(&self) -> vk::Extent2D;
}

impl ExtentSource for winit::window::Window {
    fn current_extent(&self) -> vk::Extent2D {
        let size = self.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }
}

impl<T: ExtentSource + ?Sized> ExtentSource for Arc<T> {
    fn current_extent(&self) -> vk::Extent2D {
        (**self).current_extent()
    }
}

impl<T: ExtentSource + ?Sized> ExtentSource for &T {
    fn current_extent(&self) -> vk::Extent2D {
        (**self).current_extent()
    }
}

/// An extent that never changes. Useful for offscreen tools and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedExtent(pub vk::Extent2D);

impl FixedExtent {
    pub fn new(width: u32, height: u32) -> Self {
        Self(vk::Extent2D { width, height })
    }
}

impl ExtentSource for FixedExtent {
    fn current_extent(&self) -> vk::Extent2D {
        self.0
    }
}

/// Creates the Vulkan surface the swapchain presents to.
pub trait SurfaceProvider: ExtentSource {
    /// # Safety
    /// `entry` and `instance` must be valid and `instance` must have been
    /// created with [`required_extensions`](Self::required_extensions) enabled.
    unsafe fn create_surface(&self, entry: &Entry, instance: &Instance) -> Result<vk::SurfaceKHR>;

    fn required_extensions(&self) -> Vec<*const c_char> {
        let mut extensions = vec![surface::NAME.as_ptr()];

        #[cfg(target_os = "windows")]
        extensions.push(ash::khr::win32_surface::NAME.as_ptr());

        #[cfg(target_os = "linux")]
        {
            extensions.push(ash::khr::xlib_surface::NAME.as_ptr());
            extensions.push(ash::khr::wayland_surface::NAME.as_ptr());
        }

        extensions
    }
}

/// Surface provider for anything that exposes raw window and display
/// handles, such as a shared `winit` window.
pub struct WindowSurfaceProvider<W> {
    window: W,
}

impl<W> WindowSurfaceProvider<W> {
    pub fn new(window: W) -> Self {
        Self { window }
    }

    pub fn window(&self) -> &W {
        &self.window
    }
}

impl<W: ExtentSource> ExtentSource for WindowSurfaceProvider<W> {
    fn current_extent(&self) -> vk::Extent2D {
        self.window.current_extent()
    }
}

impl<W> SurfaceProvider for WindowSurfaceProvider<W>
where
    W: HasWindowHandle + HasDisplayHandle + ExtentSource,
{
    unsafe fn create_surface(&self, entry: &Entry, instance: &Instance) -> Result<vk::SurfaceKHR> {
        create_surface_from_handles(entry, instance, &self.window)
    }
}

fn invalid_handle() -> RenderError {
    RenderError::Creation("unsupported window handle".to_string())
}

#[cfg(target_os = "windows")]
unsafe fn create_surface_from_handles<W: HasWindowHandle>(
    entry: &Entry,
    instance: &Instance,
    window: &W,
) -> Result<vk::SurfaceKHR> {
    use ash::khr::win32_surface;

    match window.window_handle().map(|h| h.as_raw()) {
        Ok(RawWindowHandle::Win32(handle)) => {
            let loader = win32_surface::Instance::new(entry, instance);
            let hinstance = handle.hinstance.map(|h| h.get()).unwrap_or(0);
            let create_info = vk::Win32SurfaceCreateInfoKHR::default()
                .hwnd(handle.hwnd.get() as vk::HWND)
                .hinstance(hinstance as vk::HINSTANCE);
            Ok(loader.create_win32_surface(&create_info, None)?)
        }
        _ => Err(invalid_handle()),
    }
}

#[cfg(target_os = "linux")]
unsafe fn create_surface_from_handles<W: HasWindowHandle + HasDisplayHandle>(
    entry: &Entry,
    instance: &Instance,
    window: &W,
) -> Result<vk::SurfaceKHR> {
    use ash::khr::{wayland_surface, xlib_surface};

    let display = window
        .display_handle()
        .map_err(|e| RenderError::Creation(format!("no display handle: {e}")))?
        .as_raw();

    match window.window_handle().map(|h| h.as_raw()) {
        Ok(RawWindowHandle::Wayland(handle)) => {
            let RawDisplayHandle::Wayland(display) = display else {
                return Err(invalid_handle());
            };
            let loader = wayland_surface::Instance::new(entry, instance);
            let create_info = vk::WaylandSurfaceCreateInfoKHR::default()
                .display(display.display.as_ptr())
                .surface(handle.surface.as_ptr());
            Ok(loader.create_wayland_surface(&create_info, None)?)
        }
        Ok(RawWindowHandle::Xlib(handle)) => {
            let dpy = match display {
                RawDisplayHandle::Xlib(display) => display
                    .display
                    .map(|d| d.as_ptr())
                    .unwrap_or(std::ptr::null_mut()),
                _ => std::ptr::null_mut(),
            };
            let loader = xlib_surface::Instance::new(entry, instance);
            let create_info = vk::XlibSurfaceCreateInfoKHR::default()
                .dpy(dpy as *mut _)
                .window(handle.window);
            Ok(loader.create_xlib_surface(&create_info, None)?)
        }
        _ => Err(invalid_handle()),
    }
}

#[cfg(not(any(target_os = "windows", target_os = "linux")))]
unsafe fn create_surface_from_handles<W: HasWindowHandle + HasDisplayHandle>(
    _entry: &Entry,
    _instance: &Instance,
    _window: &W,
) -> Result<vk::SurfaceKHR> {
    Err(RenderError::Creation(
        "surface creation is not supported on this platform".to_string(),
    ))
}
