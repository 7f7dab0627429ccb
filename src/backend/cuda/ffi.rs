//! Runtime-loaded bindings to the CUDA driver API.
//!
//! Only the entry points the runner needs are resolved: memory, streams,
//! async copies and stream capture. The driver library is opened with
//! `libloading` so the crate has no link-time CUDA dependency.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr};

use libloading::Library;

pub type CUresult = c_int;
pub type CUdevice = c_int;
pub type CUdeviceptr = u64;
pub type CUcontext = *mut c_void;
pub type CUstream = *mut c_void;
pub type CUgraph = *mut c_void;
pub type CUgraphExec = *mut c_void;

pub const CUDA_SUCCESS: CUresult = 0;
pub const CU_STREAM_NON_BLOCKING: c_uint = 0x1;
/// Only this thread's unsafe calls are prohibited while capturing.
pub const CU_STREAM_CAPTURE_MODE_THREAD_LOCAL: c_uint = 1;

#[cfg(target_os = "windows")]
const LIBRARY_NAMES: &[&str] = &["nvcuda.dll"];
#[cfg(not(target_os = "windows"))]
const LIBRARY_NAMES: &[&str] = &["libcuda.so.1", "libcuda.so"];

type FnInit = unsafe extern "C" fn(c_uint) -> CUresult;
type FnDeviceGet = unsafe extern "C" fn(*mut CUdevice, c_int) -> CUresult;
type FnDeviceGetName = unsafe extern "C" fn(*mut c_char, c_int, CUdevice) -> CUresult;
type FnPrimaryCtxRetain = unsafe extern "C" fn(*mut CUcontext, CUdevice) -> CUresult;
type FnPrimaryCtxRelease = unsafe extern "C" fn(CUdevice) -> CUresult;
type FnCtxSetCurrent = unsafe extern "C" fn(CUcontext) -> CUresult;
type FnMemAlloc = unsafe extern "C" fn(*mut CUdeviceptr, usize) -> CUresult;
type FnMemFree = unsafe extern "C" fn(CUdeviceptr) -> CUresult;
type FnStreamCreate = unsafe extern "C" fn(*mut CUstream, c_uint) -> CUresult;
type FnStreamDestroy = unsafe extern "C" fn(CUstream) -> CUresult;
type FnStreamSynchronize = unsafe extern "C" fn(CUstream) -> CUresult;
type FnMemcpyHtoDAsync =
    unsafe extern "C" fn(CUdeviceptr, *const c_void, usize, CUstream) -> CUresult;
type FnMemcpyDtoHAsync =
    unsafe extern "C" fn(*mut c_void, CUdeviceptr, usize, CUstream) -> CUresult;
type FnMemcpyDtoDAsync =
    unsafe extern "C" fn(CUdeviceptr, CUdeviceptr, usize, CUstream) -> CUresult;
type FnStreamBeginCapture = unsafe extern "C" fn(CUstream, c_uint) -> CUresult;
type FnStreamEndCapture = unsafe extern "C" fn(CUstream, *mut CUgraph) -> CUresult;
type FnGraphInstantiate = unsafe extern "C" fn(*mut CUgraphExec, CUgraph, u64) -> CUresult;
type FnGraphLaunch = unsafe extern "C" fn(CUgraphExec, CUstream) -> CUresult;
type FnGraphDestroy = unsafe extern "C" fn(CUgraph) -> CUresult;
type FnGraphExecDestroy = unsafe extern "C" fn(CUgraphExec) -> CUresult;
type FnGetErrorString = unsafe extern "C" fn(CUresult, *mut *const c_char) -> CUresult;

/// Resolved driver entry points plus the retained primary context.
pub struct CudaApi {
    _lib: Library,
    device: CUdevice,
    ctx: CUcontext,
    primary_ctx_release: FnPrimaryCtxRelease,
    ctx_set_current: FnCtxSetCurrent,
    device_get_name: FnDeviceGetName,
    mem_alloc: FnMemAlloc,
    mem_free: FnMemFree,
    stream_create: FnStreamCreate,
    stream_destroy: FnStreamDestroy,
    stream_synchronize: FnStreamSynchronize,
    memcpy_htod_async: FnMemcpyHtoDAsync,
    memcpy_dtoh_async: FnMemcpyDtoHAsync,
    memcpy_dtod_async: FnMemcpyDtoDAsync,
    stream_begin_capture: FnStreamBeginCapture,
    stream_end_capture: FnStreamEndCapture,
    graph_instantiate: FnGraphInstantiate,
    graph_launch: FnGraphLaunch,
    graph_destroy: FnGraphDestroy,
    graph_exec_destroy: FnGraphExecDestroy,
    get_error_string: FnGetErrorString,
}

// SAFETY: the driver API is thread-safe and the primary context may be made
// current on any thread. Raw handles are plain integers to the driver.
unsafe impl Send for CudaApi {}
unsafe impl Sync for CudaApi {}

macro_rules! sym {
    ($lib:expr, $ty:ty, $name:literal) => {{
        // SAFETY: the symbol type matches the driver's documented signature.
        let sym = unsafe { $lib.get::<$ty>(concat!($name, "\0").as_bytes()) }
            .map_err(|e| format!("missing driver symbol {}: {}", $name, e))?;
        *sym
    }};
}

impl CudaApi {
    /// Open the driver, initialise it and retain the primary context of
    /// device 0.
    pub fn load() -> Result<Self, String> {
        let lib = LIBRARY_NAMES
            .iter()
            // SAFETY: loading the vendor driver runs only its initialisers.
            .find_map(|name| unsafe { Library::new(name) }.ok())
            .ok_or_else(|| format!("CUDA driver not found (tried {:?})", LIBRARY_NAMES))?;

        let init: FnInit = sym!(lib, FnInit, "cuInit");
        let device_get: FnDeviceGet = sym!(lib, FnDeviceGet, "cuDeviceGet");
        let primary_ctx_retain: FnPrimaryCtxRetain =
            sym!(lib, FnPrimaryCtxRetain, "cuDevicePrimaryCtxRetain");

        let mut api = Self {
            device: 0,
            ctx: std::ptr::null_mut(),
            primary_ctx_release: sym!(
                lib,
                FnPrimaryCtxRelease,
                "cuDevicePrimaryCtxRelease_v2"
            ),
            ctx_set_current: sym!(lib, FnCtxSetCurrent, "cuCtxSetCurrent"),
            device_get_name: sym!(lib, FnDeviceGetName, "cuDeviceGetName"),
            mem_alloc: sym!(lib, FnMemAlloc, "cuMemAlloc_v2"),
            mem_free: sym!(lib, FnMemFree, "cuMemFree_v2"),
            stream_create: sym!(lib, FnStreamCreate, "cuStreamCreate"),
            stream_destroy: sym!(lib, FnStreamDestroy, "cuStreamDestroy_v2"),
            stream_synchronize: sym!(lib, FnStreamSynchronize, "cuStreamSynchronize"),
            memcpy_htod_async: sym!(lib, FnMemcpyHtoDAsync, "cuMemcpyHtoDAsync_v2"),
            memcpy_dtoh_async: sym!(lib, FnMemcpyDtoHAsync, "cuMemcpyDtoHAsync_v2"),
            memcpy_dtod_async: sym!(lib, FnMemcpyDtoDAsync, "cuMemcpyDtoDAsync_v2"),
            stream_begin_capture: sym!(lib, FnStreamBeginCapture, "cuStreamBeginCapture_v2"),
            stream_end_capture: sym!(lib, FnStreamEndCapture, "cuStreamEndCapture"),
            graph_instantiate: sym!(lib, FnGraphInstantiate, "cuGraphInstantiateWithFlags"),
            graph_launch: sym!(lib, FnGraphLaunch, "cuGraphLaunch"),
            graph_destroy: sym!(lib, FnGraphDestroy, "cuGraphDestroy"),
            graph_exec_destroy: sym!(lib, FnGraphExecDestroy, "cuGraphExecDestroy"),
            get_error_string: sym!(lib, FnGetErrorString, "cuGetErrorString"),
            _lib: lib,
        };

        // SAFETY: plain driver calls with valid out-pointers.
        unsafe {
            api.check(init(0), "cuInit")?;
            let mut device: CUdevice = 0;
            api.check(device_get(&mut device, 0), "cuDeviceGet")?;
            let mut ctx: CUcontext = std::ptr::null_mut();
            api.check(primary_ctx_retain(&mut ctx, device), "cuDevicePrimaryCtxRetain")?;
            api.device = device;
            api.ctx = ctx;
        }
        api.make_current()?;
        Ok(api)
    }

    fn check(&self, result: CUresult, call: &str) -> Result<(), String> {
        if result == CUDA_SUCCESS {
            return Ok(());
        }
        let mut msg: *const c_char = std::ptr::null();
        // SAFETY: cuGetErrorString writes a pointer to a static string.
        let text = unsafe {
            if (self.get_error_string)(result, &mut msg) == CUDA_SUCCESS && !msg.is_null() {
                CStr::from_ptr(msg).to_string_lossy().into_owned()
            } else {
                "unknown error".to_string()
            }
        };
        Err(format!("{} failed with code {}: {}", call, result, text))
    }

    /// Bind the primary context to the calling thread.
    pub fn make_current(&self) -> Result<(), String> {
        // SAFETY: ctx was retained in load() and lives until drop.
        self.check(unsafe { (self.ctx_set_current)(self.ctx) }, "cuCtxSetCurrent")
    }

    pub fn device_name(&self) -> Result<String, String> {
        let mut buf = [0 as c_char; 256];
        // SAFETY: buf is large enough and NUL-terminated by the driver.
        unsafe {
            self.check(
                (self.device_get_name)(buf.as_mut_ptr(), buf.len() as c_int, self.device),
                "cuDeviceGetName",
            )?;
            Ok(CStr::from_ptr(buf.as_ptr()).to_string_lossy().into_owned())
        }
    }

    pub fn mem_alloc(&self, bytes: usize) -> Result<CUdeviceptr, String> {
        let mut ptr: CUdeviceptr = 0;
        // SAFETY: valid out-pointer.
        self.check(unsafe { (self.mem_alloc)(&mut ptr, bytes) }, "cuMemAlloc")?;
        Ok(ptr)
    }

    pub fn mem_free(&self, ptr: CUdeviceptr) -> Result<(), String> {
        // SAFETY: ptr came from mem_alloc.
        self.check(unsafe { (self.mem_free)(ptr) }, "cuMemFree")
    }

    pub fn stream_create(&self) -> Result<CUstream, String> {
        let mut stream: CUstream = std::ptr::null_mut();
        // SAFETY: valid out-pointer.
        self.check(
            unsafe { (self.stream_create)(&mut stream, CU_STREAM_NON_BLOCKING) },
            "cuStreamCreate",
        )?;
        Ok(stream)
    }

    pub fn stream_destroy(&self, stream: CUstream) -> Result<(), String> {
        // SAFETY: stream came from stream_create.
        self.check(unsafe { (self.stream_destroy)(stream) }, "cuStreamDestroy")
    }

    pub fn stream_synchronize(&self, stream: CUstream) -> Result<(), String> {
        // SAFETY: stream came from stream_create.
        self.check(unsafe { (self.stream_synchronize)(stream) }, "cuStreamSynchronize")
    }

    pub fn memcpy_htod_async(
        &self,
        dst: CUdeviceptr,
        src: &[u8],
        stream: CUstream,
    ) -> Result<(), String> {
        // SAFETY: src is pageable host memory, which the driver stages before
        // returning.
        self.check(
            unsafe {
                (self.memcpy_htod_async)(dst, src.as_ptr() as *const c_void, src.len(), stream)
            },
            "cuMemcpyHtoDAsync",
        )
    }

    pub fn memcpy_dtoh_async(
        &self,
        dst: &mut [u8],
        src: CUdeviceptr,
        stream: CUstream,
    ) -> Result<(), String> {
        // SAFETY: copies into pageable host memory return once complete.
        self.check(
            unsafe {
                (self.memcpy_dtoh_async)(dst.as_mut_ptr() as *mut c_void, src, dst.len(), stream)
            },
            "cuMemcpyDtoHAsync",
        )
    }

    pub fn memcpy_dtod_async(
        &self,
        dst: CUdeviceptr,
        src: CUdeviceptr,
        bytes: usize,
        stream: CUstream,
    ) -> Result<(), String> {
        // SAFETY: both addresses are device allocations of at least `bytes`.
        self.check(
            unsafe { (self.memcpy_dtod_async)(dst, src, bytes, stream) },
            "cuMemcpyDtoDAsync",
        )
    }

    pub fn stream_begin_capture(&self, stream: CUstream) -> Result<(), String> {
        // SAFETY: stream came from stream_create.
        self.check(
            unsafe { (self.stream_begin_capture)(stream, CU_STREAM_CAPTURE_MODE_THREAD_LOCAL) },
            "cuStreamBeginCapture",
        )
    }

    pub fn stream_end_capture(&self, stream: CUstream) -> Result<CUgraph, String> {
        let mut graph: CUgraph = std::ptr::null_mut();
        // SAFETY: valid out-pointer.
        self.check(
            unsafe { (self.stream_end_capture)(stream, &mut graph) },
            "cuStreamEndCapture",
        )?;
        Ok(graph)
    }

    pub fn graph_instantiate(&self, graph: CUgraph) -> Result<CUgraphExec, String> {
        let mut exec: CUgraphExec = std::ptr::null_mut();
        // SAFETY: valid out-pointer, graph came from stream_end_capture.
        self.check(
            unsafe { (self.graph_instantiate)(&mut exec, graph, 0) },
            "cuGraphInstantiate",
        )?;
        Ok(exec)
    }

    pub fn graph_launch(&self, exec: CUgraphExec, stream: CUstream) -> Result<(), String> {
        // SAFETY: exec came from graph_instantiate.
        self.check(unsafe { (self.graph_launch)(exec, stream) }, "cuGraphLaunch")
    }

    pub fn graph_destroy(&self, graph: CUgraph) -> Result<(), String> {
        // SAFETY: graph came from stream_end_capture.
        self.check(unsafe { (self.graph_destroy)(graph) }, "cuGraphDestroy")
    }

    pub fn graph_exec_destroy(&self, exec: CUgraphExec) -> Result<(), String> {
        // SAFETY: exec came from graph_instantiate.
        self.check(unsafe { (self.graph_exec_destroy)(exec) }, "cuGraphExecDestroy")
    }
}

impl Drop for CudaApi {
    fn drop(&mut self) {
        if !self.ctx.is_null() {
            // SAFETY: balances the retain in load().
            let result = unsafe { (self.primary_ctx_release)(self.device) };
            if result != CUDA_SUCCESS {
                tracing::warn!(code = result, "CUDA: failed to release primary context");
            }
        }
    }
}
