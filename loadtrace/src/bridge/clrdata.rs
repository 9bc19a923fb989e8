//! CLR data access (`IXCLRDataProcess`) over raw COM vtables
//!
//! The runtime's debugging-data library exports a single factory,
//! `CLRDataCreateInstance`, which binds an `IXCLRDataProcess` to an
//! `ICLRDataTarget` we implement. The query chain is:
//!
//! ```text
//! IXCLRDataProcess::EnumMethodInstanceByAddress(address)
//!   └─► IXCLRDataMethodInstance::GetDefinition
//!         └─► IXCLRDataMethodDefinition::GetTypeDefinition
//!               └─► IXCLRDataTypeDefinition::GetModule
//!                     └─► IXCLRDataModule::GetFileName
//! ```
//!
//! Every interface pointer is held in a [`ComPtr`] so each exit path releases
//! exactly what it acquired.

#![allow(unsafe_code)] // COM vtables and the data-target shim are FFI

use std::ffi::c_void;
use std::path::PathBuf;
use std::ptr::{self, NonNull};

use widestring::{U16CStr, U16Str};
use windows_sys::core::{GUID, HRESULT};
use windows_sys::Win32::Foundation::{E_FAIL, E_NOINTERFACE, E_NOTIMPL, E_POINTER, S_OK};
use windows_sys::Win32::System::LibraryLoader::GetModuleHandleW;

use super::{DataTarget, DebugDataProvider, DebugDataService};
use crate::domain::{BridgeError, LibraryError};
use crate::library::Library;
use crate::symbolization::module_lookup::module_file_name;

const IID_IUNKNOWN: GUID = GUID::from_u128(0x0000_0000_0000_0000_c000_0000_0000_0046);
const IID_ICLR_DATA_TARGET: GUID = GUID::from_u128(0x3e11_ccee_d08b_43e5_af01_3271_7a64_da03);
const IID_IXCLR_DATA_PROCESS: GUID = GUID::from_u128(0x5c55_2ab6_fc09_4cb3_8e36_22fa_03c7_98b7);

/// Runtime module and the debugging-data library shipped beside it
const RUNTIMES: [(&str, &str); 2] =
    [("clr.dll", "mscordacwks.dll"), ("coreclr.dll", "mscordaccore.dll")];

const CREATE_INSTANCE: &std::ffi::CStr = c"CLRDataCreateInstance";

/// Longest module file name requested from the service
const MAX_FILE_NAME: usize = 2048;

// Vtable slots (IUnknown occupies 0..=2)
const RELEASE: usize = 2;
const PROCESS_START_ENUM_METHOD_INSTANCES_BY_ADDRESS: usize = 27;
const PROCESS_ENUM_METHOD_INSTANCE_BY_ADDRESS: usize = 28;
const PROCESS_END_ENUM_METHOD_INSTANCES_BY_ADDRESS: usize = 29;
const METHOD_INSTANCE_GET_DEFINITION: usize = 4;
const METHOD_DEFINITION_GET_TYPE_DEFINITION: usize = 3;
const TYPE_DEFINITION_GET_MODULE: usize = 3;
const MODULE_GET_FILE_NAME: usize = 30;

type CreateInstanceFn = unsafe extern "system" fn(
    iid: *const GUID,
    target: *mut c_void,
    iface: *mut *mut c_void,
) -> HRESULT;

// ============================================================================
// Provider / Service
// ============================================================================

/// Loads the debugging-data library of whichever CLR is in the process
#[derive(Debug, Clone, Copy, Default)]
pub struct ClrDataProvider;

impl DebugDataProvider for ClrDataProvider {
    fn load(&self) -> Result<Box<dyn DebugDataService>, BridgeError> {
        let (runtime, dac_name) = find_runtime().ok_or(BridgeError::RuntimeNotFound)?;

        let dac_path = runtime.with_file_name(dac_name);
        let library = Library::open(&dac_path).map_err(|LibraryError::Open { path, reason }| {
            BridgeError::LibraryLoad { path, reason }
        })?;

        let create = library
            .symbol(CREATE_INSTANCE)
            .ok_or(BridgeError::MissingExport { name: "CLRDataCreateInstance" })?;
        // SAFETY: CLRDataCreateInstance has exactly this signature
        let create: CreateInstanceFn = unsafe { std::mem::transmute(create.as_ptr()) };

        log::info!("Using {} for {}", dac_path.display(), runtime.display());
        Ok(Box::new(ClrDataService { create, _library: library }))
    }
}

/// The first loaded runtime and the name of its debugging-data library
fn find_runtime() -> Option<(PathBuf, &'static str)> {
    RUNTIMES
        .iter()
        .find_map(|&(runtime, dac)| loaded_module_path(runtime).map(|path| (path, dac)))
}

/// Path of the managed runtime module loaded in this process, if any
#[must_use]
pub fn loaded_runtime() -> Option<PathBuf> {
    find_runtime().map(|(runtime, _)| runtime)
}

/// Path of an already-loaded module, without taking a reference on it
fn loaded_module_path(name: &str) -> Option<PathBuf> {
    let wide = widestring::U16CString::from_str(name).ok()?;
    // SAFETY: `wide` is NUL-terminated
    let module = unsafe { GetModuleHandleW(wide.as_ptr()) };
    if module.is_null() {
        return None;
    }
    module_file_name(module)
}

struct ClrDataService {
    create: CreateInstanceFn,
    // Keeps `create` valid
    _library: Library,
}

impl DebugDataService for ClrDataService {
    fn owning_module(&self, target: &dyn DataTarget, address: u64) -> Result<PathBuf, BridgeError> {
        let shim = TargetShim::new(target);
        let process = self.create_process(&shim)?;

        let method = method_instance_at(&process, address)?;
        let definition = method.get(METHOD_INSTANCE_GET_DEFINITION, "GetDefinition")?;
        let type_definition =
            definition.get(METHOD_DEFINITION_GET_TYPE_DEFINITION, "GetTypeDefinition")?;
        let module = type_definition.get(TYPE_DEFINITION_GET_MODULE, "GetModule")?;

        file_name(&module)
    }
}

impl ClrDataService {
    fn create_process(&self, shim: &TargetShim<'_>) -> Result<ComPtr, BridgeError> {
        let mut process = ptr::null_mut();
        // SAFETY: the shim is a valid ICLRDataTarget that outlives the
        // returned interface (callers drop the process first)
        let hr = unsafe { (self.create)(&IID_IXCLR_DATA_PROCESS, shim.as_raw(), &mut process) };
        check(hr, "CLRDataCreateInstance")?;
        // SAFETY: on success the factory returns an owned reference
        unsafe { ComPtr::from_raw(process) }
            .ok_or(BridgeError::Status { call: "CLRDataCreateInstance", status: 0 })
    }
}

fn method_instance_at(process: &ComPtr, address: u64) -> Result<ComPtr, BridgeError> {
    type StartEnum = unsafe extern "system" fn(*mut c_void, u64, *mut c_void, *mut u64) -> HRESULT;
    type EnumNext = unsafe extern "system" fn(*mut c_void, *mut u64, *mut *mut c_void) -> HRESULT;
    type EndEnum = unsafe extern "system" fn(*mut c_void, u64) -> HRESULT;

    let mut handle = 0u64;
    // SAFETY: slots 27..=29 of IXCLRDataProcess have these signatures
    unsafe {
        let start: StartEnum = process.method(PROCESS_START_ENUM_METHOD_INSTANCES_BY_ADDRESS);
        check(
            start(process.as_raw(), address, ptr::null_mut(), &mut handle),
            "StartEnumMethodInstancesByAddress",
        )?;

        let next: EnumNext = process.method(PROCESS_ENUM_METHOD_INSTANCE_BY_ADDRESS);
        let mut method = ptr::null_mut();
        let hr = next(process.as_raw(), &mut handle, &mut method);

        let end: EndEnum = process.method(PROCESS_END_ENUM_METHOD_INSTANCES_BY_ADDRESS);
        end(process.as_raw(), handle);

        check(hr, "EnumMethodInstanceByAddress")?;
        // S_FALSE with no instance means no method covers the address
        ComPtr::from_raw(method)
            .ok_or(BridgeError::Status { call: "EnumMethodInstanceByAddress", status: hr as u32 })
    }
}

fn file_name(module: &ComPtr) -> Result<PathBuf, BridgeError> {
    type GetFileName = unsafe extern "system" fn(*mut c_void, u32, *mut u32, *mut u16) -> HRESULT;

    let mut buffer = vec![0u16; MAX_FILE_NAME];
    let mut len = 0u32;
    // SAFETY: slot 30 of IXCLRDataModule is GetFileName; buffer holds MAX_FILE_NAME units
    let hr = unsafe {
        let get: GetFileName = module.method(MODULE_GET_FILE_NAME);
        get(module.as_raw(), MAX_FILE_NAME as u32, &mut len, buffer.as_mut_ptr())
    };
    check(hr, "GetFileName")?;

    let name = U16CStr::from_slice_truncate(&buffer)
        .map(U16CStr::as_ustr)
        .unwrap_or_else(|_| U16Str::from_slice(&buffer));
    if name.is_empty() {
        return Err(BridgeError::Status { call: "GetFileName", status: hr as u32 });
    }
    Ok(PathBuf::from(name.to_os_string()))
}

fn check(hr: HRESULT, call: &'static str) -> Result<(), BridgeError> {
    if hr < 0 {
        Err(BridgeError::Status { call, status: hr as u32 })
    } else {
        Ok(())
    }
}

// ============================================================================
// Owned interface pointers
// ============================================================================

/// One owned reference on a COM interface
struct ComPtr(NonNull<c_void>);

impl ComPtr {
    /// # Safety
    /// `raw` must be null or an interface pointer whose reference we own
    unsafe fn from_raw(raw: *mut c_void) -> Option<Self> {
        NonNull::new(raw).map(Self)
    }

    fn as_raw(&self) -> *mut c_void {
        self.0.as_ptr()
    }

    /// Read vtable slot `index` as a function pointer of type `F`
    ///
    /// # Safety
    /// The interface must have at least `index + 1` slots and slot `index`
    /// must have signature `F`.
    unsafe fn method<F: Copy>(&self, index: usize) -> F {
        // SAFETY: a COM object starts with its vtable pointer
        unsafe {
            let vtbl = *self.0.as_ptr().cast::<*const *const c_void>();
            let slot = *vtbl.add(index);
            std::mem::transmute_copy::<*const c_void, F>(&slot)
        }
    }

    /// Call a `HRESULT Get(this, IOut** out)` accessor
    fn get(&self, index: usize, call: &'static str) -> Result<ComPtr, BridgeError> {
        type Getter = unsafe extern "system" fn(*mut c_void, *mut *mut c_void) -> HRESULT;

        let mut out = ptr::null_mut();
        // SAFETY: callers pass the slot of a getter with this signature
        let hr = unsafe {
            let get: Getter = self.method(index);
            get(self.as_raw(), &mut out)
        };
        check(hr, call)?;
        // SAFETY: getters hand out owned references
        unsafe { ComPtr::from_raw(out) }.ok_or(BridgeError::Status { call, status: hr as u32 })
    }
}

impl Drop for ComPtr {
    fn drop(&mut self) {
        type ReleaseFn = unsafe extern "system" fn(*mut c_void) -> u32;
        // SAFETY: slot 2 of every COM interface is Release, and we own one reference
        unsafe {
            let release: ReleaseFn = self.method(RELEASE);
            release(self.as_raw());
        }
    }
}

// ============================================================================
// ICLRDataTarget shim
// ============================================================================

#[repr(C)]
struct DataTargetVtbl {
    query_interface:
        unsafe extern "system" fn(*mut c_void, *const GUID, *mut *mut c_void) -> HRESULT,
    add_ref: unsafe extern "system" fn(*mut c_void) -> u32,
    release: unsafe extern "system" fn(*mut c_void) -> u32,
    get_machine_type: unsafe extern "system" fn(*mut c_void, *mut u32) -> HRESULT,
    get_pointer_size: unsafe extern "system" fn(*mut c_void, *mut u32) -> HRESULT,
    get_image_base: unsafe extern "system" fn(*mut c_void, *const u16, *mut u64) -> HRESULT,
    read_virtual: unsafe extern "system" fn(*mut c_void, u64, *mut u8, u32, *mut u32) -> HRESULT,
    write_virtual: unsafe extern "system" fn(*mut c_void, u64, *const u8, u32, *mut u32) -> HRESULT,
    get_tls_value: unsafe extern "system" fn(*mut c_void, u32, u32, *mut u64) -> HRESULT,
    set_tls_value: unsafe extern "system" fn(*mut c_void, u32, u32, u64) -> HRESULT,
    get_current_thread_id: unsafe extern "system" fn(*mut c_void, *mut u32) -> HRESULT,
    get_thread_context: unsafe extern "system" fn(*mut c_void, u32, u32, u32, *mut u8) -> HRESULT,
    set_thread_context: unsafe extern "system" fn(*mut c_void, u32, u32, *const u8) -> HRESULT,
    request: unsafe extern "system" fn(*mut c_void, u32, u32, *const u8, u32, *mut u8) -> HRESULT,
}

static DATA_TARGET_VTBL: DataTargetVtbl = DataTargetVtbl {
    query_interface: shim_query_interface,
    add_ref: shim_add_ref,
    release: shim_release,
    get_machine_type: shim_get_machine_type,
    get_pointer_size: shim_get_pointer_size,
    get_image_base: shim_get_image_base,
    read_virtual: shim_read_virtual,
    write_virtual: shim_write_virtual,
    get_tls_value: shim_get_tls_value,
    set_tls_value: shim_set_tls_value,
    get_current_thread_id: shim_get_current_thread_id,
    get_thread_context: shim_get_thread_context,
    set_thread_context: shim_set_thread_context,
    request: shim_request,
};

/// Stack-allocated `ICLRDataTarget` forwarding to a [`DataTarget`]
///
/// Reference counting is a no-op: the shim lives on the caller's stack and
/// every interface bound to it is released before it goes out of scope.
#[repr(C)]
struct TargetShim<'a> {
    vtbl: &'static DataTargetVtbl,
    target: &'a dyn DataTarget,
}

impl<'a> TargetShim<'a> {
    fn new(target: &'a dyn DataTarget) -> Self {
        Self { vtbl: &DATA_TARGET_VTBL, target }
    }

    fn as_raw(&self) -> *mut c_void {
        ptr::from_ref(self).cast_mut().cast()
    }
}

/// # Safety
/// `this` must be a pointer produced by [`TargetShim::as_raw`]
unsafe fn target_of<'a>(this: *mut c_void) -> &'a dyn DataTarget {
    // SAFETY: guaranteed by the caller
    unsafe { (*this.cast::<TargetShim<'a>>()).target }
}

fn hresult_of(error: &BridgeError) -> HRESULT {
    match error {
        BridgeError::NotImplemented(_) => E_NOTIMPL,
        _ => E_FAIL,
    }
}

fn same_guid(a: &GUID, b: &GUID) -> bool {
    a.data1 == b.data1 && a.data2 == b.data2 && a.data3 == b.data3 && a.data4 == b.data4
}

/// # Safety
/// `ptr` must be null or valid for `len` bytes
unsafe fn bytes<'a>(ptr: *const u8, len: u32) -> &'a [u8] {
    if ptr.is_null() {
        &[]
    } else {
        // SAFETY: guaranteed by the caller
        unsafe { std::slice::from_raw_parts(ptr, len as usize) }
    }
}

/// # Safety
/// `ptr` must be null or valid for `len` writable bytes
unsafe fn bytes_mut<'a>(ptr: *mut u8, len: u32) -> &'a mut [u8] {
    if ptr.is_null() {
        &mut []
    } else {
        // SAFETY: guaranteed by the caller
        unsafe { std::slice::from_raw_parts_mut(ptr, len as usize) }
    }
}

unsafe extern "system" fn shim_query_interface(
    this: *mut c_void,
    riid: *const GUID,
    out: *mut *mut c_void,
) -> HRESULT {
    if riid.is_null() || out.is_null() {
        return E_POINTER;
    }
    // SAFETY: both pointers were checked for null and come from the service
    unsafe {
        if same_guid(&*riid, &IID_IUNKNOWN) || same_guid(&*riid, &IID_ICLR_DATA_TARGET) {
            *out = this;
            S_OK
        } else {
            *out = ptr::null_mut();
            E_NOINTERFACE
        }
    }
}

unsafe extern "system" fn shim_add_ref(_this: *mut c_void) -> u32 {
    1
}

unsafe extern "system" fn shim_release(_this: *mut c_void) -> u32 {
    0
}

unsafe extern "system" fn shim_get_machine_type(this: *mut c_void, machine: *mut u32) -> HRESULT {
    if machine.is_null() {
        return E_POINTER;
    }
    // SAFETY: `this` is our shim and `machine` is writable
    unsafe { *machine = target_of(this).machine_type() };
    S_OK
}

unsafe extern "system" fn shim_get_pointer_size(this: *mut c_void, size: *mut u32) -> HRESULT {
    if size.is_null() {
        return E_POINTER;
    }
    // SAFETY: `this` is our shim and `size` is writable
    unsafe { *size = target_of(this).pointer_size() };
    S_OK
}

unsafe extern "system" fn shim_get_image_base(
    this: *mut c_void,
    image: *const u16,
    base: *mut u64,
) -> HRESULT {
    if image.is_null() || base.is_null() {
        return E_POINTER;
    }
    // SAFETY: the service passes a NUL-terminated image name and a writable out pointer
    unsafe {
        let name = U16CStr::from_ptr_str(image).to_string_lossy();
        match target_of(this).image_base(&name) {
            Ok(address) => {
                *base = address;
                S_OK
            }
            Err(e) => hresult_of(&e),
        }
    }
}

unsafe extern "system" fn shim_read_virtual(
    this: *mut c_void,
    address: u64,
    buffer: *mut u8,
    requested: u32,
    read: *mut u32,
) -> HRESULT {
    // SAFETY: the service passes a buffer of `requested` bytes
    unsafe {
        match target_of(this).read_virtual(address, bytes_mut(buffer, requested)) {
            Ok(n) => {
                if !read.is_null() {
                    *read = n as u32;
                }
                S_OK
            }
            Err(e) => hresult_of(&e),
        }
    }
}

unsafe extern "system" fn shim_write_virtual(
    this: *mut c_void,
    address: u64,
    buffer: *const u8,
    requested: u32,
    written: *mut u32,
) -> HRESULT {
    // SAFETY: the service passes a buffer of `requested` bytes
    unsafe {
        match target_of(this).write_virtual(address, bytes(buffer, requested)) {
            Ok(n) => {
                if !written.is_null() {
                    *written = n as u32;
                }
                S_OK
            }
            Err(e) => hresult_of(&e),
        }
    }
}

unsafe extern "system" fn shim_get_tls_value(
    this: *mut c_void,
    thread_id: u32,
    index: u32,
    value: *mut u64,
) -> HRESULT {
    // SAFETY: `this` is our shim; `value` is checked before writing
    unsafe {
        match target_of(this).tls_value(thread_id, index) {
            Ok(v) if !value.is_null() => {
                *value = v;
                S_OK
            }
            Ok(_) => E_POINTER,
            Err(e) => hresult_of(&e),
        }
    }
}

unsafe extern "system" fn shim_set_tls_value(
    this: *mut c_void,
    thread_id: u32,
    index: u32,
    value: u64,
) -> HRESULT {
    // SAFETY: `this` is our shim
    match unsafe { target_of(this) }.set_tls_value(thread_id, index, value) {
        Ok(()) => S_OK,
        Err(e) => hresult_of(&e),
    }
}

unsafe extern "system" fn shim_get_current_thread_id(
    this: *mut c_void,
    thread_id: *mut u32,
) -> HRESULT {
    // SAFETY: `this` is our shim; `thread_id` is checked before writing
    unsafe {
        match target_of(this).current_thread_id() {
            Ok(id) if !thread_id.is_null() => {
                *thread_id = id;
                S_OK
            }
            Ok(_) => E_POINTER,
            Err(e) => hresult_of(&e),
        }
    }
}

unsafe extern "system" fn shim_get_thread_context(
    this: *mut c_void,
    thread_id: u32,
    flags: u32,
    size: u32,
    context: *mut u8,
) -> HRESULT {
    // SAFETY: the service passes a buffer of `size` bytes
    match unsafe { target_of(this).thread_context(thread_id, flags, bytes_mut(context, size)) } {
        Ok(()) => S_OK,
        Err(e) => hresult_of(&e),
    }
}

unsafe extern "system" fn shim_set_thread_context(
    this: *mut c_void,
    thread_id: u32,
    size: u32,
    context: *const u8,
) -> HRESULT {
    // SAFETY: the service passes a buffer of `size` bytes
    match unsafe { target_of(this).set_thread_context(thread_id, bytes(context, size)) } {
        Ok(()) => S_OK,
        Err(e) => hresult_of(&e),
    }
}

unsafe extern "system" fn shim_request(
    this: *mut c_void,
    code: u32,
    in_size: u32,
    in_buffer: *const u8,
    out_size: u32,
    out_buffer: *mut u8,
) -> HRESULT {
    // SAFETY: the service passes buffers of the stated sizes
    let result = unsafe {
        target_of(this).request(code, bytes(in_buffer, in_size), bytes_mut(out_buffer, out_size))
    };
    match result {
        Ok(()) => S_OK,
        Err(e) => hresult_of(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::SelfTarget;

    #[test]
    fn test_shim_answers_fixed_queries() {
        let target = SelfTarget::new();
        let shim = TargetShim::new(&target);
        let mut value = 0u32;

        unsafe {
            assert_eq!((shim.vtbl.get_pointer_size)(shim.as_raw(), &mut value), S_OK);
            assert_eq!(value as usize, std::mem::size_of::<usize>());
            assert_eq!((shim.vtbl.get_machine_type)(shim.as_raw(), &mut value), S_OK);
            assert_eq!(value, loadtrace_common::HOST_MACHINE);
        }
    }

    #[test]
    fn test_shim_reports_not_implemented() {
        let target = SelfTarget::new();
        let shim = TargetShim::new(&target);
        let mut written = 0u32;
        let data = [0u8; 4];

        unsafe {
            let this = shim.as_raw();
            let hr = (shim.vtbl.write_virtual)(this, 0x1000, data.as_ptr(), 4, &mut written);
            assert_eq!(hr, E_NOTIMPL);
            assert_eq!((shim.vtbl.get_current_thread_id)(this, &mut written), E_NOTIMPL);
            let hr = (shim.vtbl.request)(this, 0, 0, ptr::null(), 0, ptr::null_mut());
            assert_eq!(hr, E_NOTIMPL);
        }
    }

    #[test]
    fn test_shim_query_interface() {
        let target = SelfTarget::new();
        let shim = TargetShim::new(&target);
        let mut out = ptr::null_mut();

        unsafe {
            let query = shim.vtbl.query_interface;
            assert_eq!(query(shim.as_raw(), &IID_ICLR_DATA_TARGET, &mut out), S_OK);
            assert_eq!(out, shim.as_raw());
            assert_eq!(query(shim.as_raw(), &IID_IXCLR_DATA_PROCESS, &mut out), E_NOINTERFACE);
            assert!(out.is_null());
        }
    }

    #[test]
    fn test_shim_reads_own_memory() {
        let target = SelfTarget::new();
        let shim = TargetShim::new(&target);
        let source = *b"clr";
        let mut buffer = [0u8; 3];
        let mut read = 0u32;

        let address = source.as_ptr() as u64;
        let hr = unsafe {
            (shim.vtbl.read_virtual)(shim.as_raw(), address, buffer.as_mut_ptr(), 3, &mut read)
        };
        assert_eq!(hr, S_OK);
        assert_eq!(read, 3);
        assert_eq!(&buffer, b"clr");
    }
}
