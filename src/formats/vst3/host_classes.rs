//! Host-side COM classes handed to VST3 plugins.
//!
//! Everything here is shared with plugin code through raw interface
//! pointers, so the implementations keep their state behind short-lived
//! mutexes and expose Rust-side accessors for the adapter. The component
//! handler forwards `performEdit`/`restartComponent` into plain callbacks
//! registered by the instance.

#![allow(non_snake_case)]

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr, CString};
use std::sync::Mutex;

use vst3::Steinberg::Vst::{
    Event, IAttributeList, IAttributeListTrait, IComponentHandler2Trait, IComponentHandlerTrait,
    IEventListTrait, IHostApplicationTrait, IMessage, IMessageTrait, IParamValueQueue,
    IParamValueQueueTrait, IParameterChangesTrait, IUnitHandlerTrait, ParamID, ParamValue,
    String128, TChar,
};
use vst3::Steinberg::{
    kInvalidArgument, kNoInterface, kResultFalse, kResultOk, tresult, FIDString, IBStreamTrait,
    TBool, TUID,
};
use vst3::{Class, ComRef, ComWrapper, Interface};

/// Copy a Rust string into a UTF-16 `String128`, NUL-terminated.
pub fn copy_wstring(source: &str, dest: &mut String128) {
    let mut length = 0;
    for (slot, unit) in dest.iter_mut().take(127).zip(source.encode_utf16()) {
        *slot = unit as TChar;
        length += 1;
    }
    dest[length] = 0;
}

/// Decode a plugin-provided UTF-16 string field.
pub fn wstring_to_string(source: &[TChar]) -> String {
    let units: Vec<u16> = source
        .iter()
        .take_while(|c| **c != 0)
        .map(|c| *c as u16)
        .collect();
    String::from_utf16_lossy(&units)
}

/// Compare two 16-byte interface/class ids through raw pointers, which
/// sidesteps the signedness of the generated id array types.
pub unsafe fn same_guid(a: *const c_void, b: *const c_void) -> bool {
    if a.is_null() || b.is_null() {
        return false;
    }
    std::slice::from_raw_parts(a as *const u8, 16) == std::slice::from_raw_parts(b as *const u8, 16)
}

// ---------------------------------------------------------------------------
// Event list
// ---------------------------------------------------------------------------

/// `IEventList` backed by a plain vector; used for both process-data
/// directions.
#[derive(Default)]
pub struct HostEventList {
    events: Mutex<Vec<Event>>,
}

unsafe impl Send for HostEventList {}
unsafe impl Sync for HostEventList {}

impl HostEventList {
    pub fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    pub fn drain(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl Class for HostEventList {
    type Interfaces = (vst3::Steinberg::Vst::IEventList,);
}

impl IEventListTrait for HostEventList {
    unsafe fn getEventCount(&self) -> i32 {
        self.events.lock().unwrap().len() as i32
    }

    unsafe fn getEvent(&self, index: i32, e: *mut Event) -> tresult {
        if e.is_null() || index < 0 {
            return kInvalidArgument;
        }
        let events = self.events.lock().unwrap();
        match events.get(index as usize) {
            Some(event) => {
                *e = *event;
                kResultOk
            }
            None => kInvalidArgument,
        }
    }

    unsafe fn addEvent(&self, e: *mut Event) -> tresult {
        if e.is_null() {
            return kInvalidArgument;
        }
        self.events.lock().unwrap().push(*e);
        kResultOk
    }
}

// ---------------------------------------------------------------------------
// Parameter changes
// ---------------------------------------------------------------------------

pub struct ParamValueQueueImpl {
    id: Mutex<ParamID>,
    points: Mutex<Vec<(i32, ParamValue)>>,
}

impl ParamValueQueueImpl {
    fn new(id: ParamID) -> Self {
        Self {
            id: Mutex::new(id),
            points: Mutex::new(Vec::new()),
        }
    }
}

impl Class for ParamValueQueueImpl {
    type Interfaces = (IParamValueQueue,);
}

impl IParamValueQueueTrait for ParamValueQueueImpl {
    unsafe fn getParameterId(&self) -> ParamID {
        *self.id.lock().unwrap()
    }

    unsafe fn getPointCount(&self) -> i32 {
        self.points.lock().unwrap().len() as i32
    }

    unsafe fn getPoint(
        &self,
        index: i32,
        sampleOffset: *mut i32,
        value: *mut ParamValue,
    ) -> tresult {
        if index < 0 || sampleOffset.is_null() || value.is_null() {
            return kInvalidArgument;
        }
        let points = self.points.lock().unwrap();
        match points.get(index as usize) {
            Some((offset, point_value)) => {
                *sampleOffset = *offset;
                *value = *point_value;
                kResultOk
            }
            None => kInvalidArgument,
        }
    }

    unsafe fn addPoint(&self, sampleOffset: i32, value: ParamValue, index: *mut i32) -> tresult {
        let mut points = self.points.lock().unwrap();
        points.push((sampleOffset, value));
        if !index.is_null() {
            *index = points.len() as i32 - 1;
        }
        kResultOk
    }
}

struct QueueEntry {
    id: ParamID,
    raw: *mut IParamValueQueue,
}

/// `IParameterChanges` as a set of per-parameter value queues. Queue objects
/// are created on demand and released on `clear`.
#[derive(Default)]
pub struct ParameterChangesImpl {
    queues: Mutex<Vec<QueueEntry>>,
}

unsafe impl Send for ParameterChangesImpl {}
unsafe impl Sync for ParameterChangesImpl {}

impl ParameterChangesImpl {
    fn create_queue(id: ParamID) -> *mut IParamValueQueue {
        ComWrapper::new(ParamValueQueueImpl::new(id))
            .to_com_ptr::<IParamValueQueue>()
            .map(|ptr| ptr.into_raw())
            .unwrap_or(std::ptr::null_mut())
    }

    /// Host-side helper: append a point to the queue for `id`, creating it
    /// when absent.
    pub fn add_point(&self, id: ParamID, sample_offset: i32, value: ParamValue) {
        let mut queues = self.queues.lock().unwrap();
        let raw = match queues.iter().find(|entry| entry.id == id) {
            Some(entry) => entry.raw,
            None => {
                let raw = Self::create_queue(id);
                if raw.is_null() {
                    return;
                }
                queues.push(QueueEntry { id, raw });
                raw
            }
        };
        unsafe {
            if let Some(queue) = ComRef::from_raw(raw) {
                let mut index = 0;
                queue.addPoint(sample_offset, value, &mut index);
            }
        }
    }

    /// Read back `(id, last value)` for every queue; used for output
    /// parameter changes.
    pub fn last_points(&self) -> Vec<(ParamID, ParamValue)> {
        let queues = self.queues.lock().unwrap();
        let mut out = Vec::with_capacity(queues.len());
        for entry in queues.iter() {
            unsafe {
                let Some(queue) = ComRef::from_raw(entry.raw) else {
                    continue;
                };
                let count = queue.getPointCount();
                if count <= 0 {
                    continue;
                }
                let mut offset = 0;
                let mut value = 0.0;
                if queue.getPoint(count - 1, &mut offset, &mut value) == kResultOk {
                    out.push((entry.id, value));
                }
            }
        }
        out
    }

    /// Release every queue.
    pub fn clear(&self) {
        let mut queues = self.queues.lock().unwrap();
        for entry in queues.drain(..) {
            unsafe {
                // Drop the reference taken at creation.
                drop(vst3::ComPtr::from_raw(entry.raw));
            }
        }
    }
}

impl Drop for ParameterChangesImpl {
    fn drop(&mut self) {
        self.clear();
    }
}

impl Class for ParameterChangesImpl {
    type Interfaces = (vst3::Steinberg::Vst::IParameterChanges,);
}

impl IParameterChangesTrait for ParameterChangesImpl {
    unsafe fn getParameterCount(&self) -> i32 {
        self.queues.lock().unwrap().len() as i32
    }

    unsafe fn getParameterData(&self, index: i32) -> *mut IParamValueQueue {
        if index < 0 {
            return std::ptr::null_mut();
        }
        let queues = self.queues.lock().unwrap();
        queues
            .get(index as usize)
            .map(|entry| entry.raw)
            .unwrap_or(std::ptr::null_mut())
    }

    unsafe fn addParameterData(&self, id: *const ParamID, index: *mut i32) -> *mut IParamValueQueue {
        if id.is_null() {
            return std::ptr::null_mut();
        }
        let id = *id;
        let mut queues = self.queues.lock().unwrap();
        if let Some(position) = queues.iter().position(|entry| entry.id == id) {
            if !index.is_null() {
                *index = position as i32;
            }
            return queues[position].raw;
        }
        let raw = Self::create_queue(id);
        if raw.is_null() {
            return std::ptr::null_mut();
        }
        queues.push(QueueEntry { id, raw });
        if !index.is_null() {
            *index = queues.len() as i32 - 1;
        }
        raw
    }
}

// ---------------------------------------------------------------------------
// Component handler
// ---------------------------------------------------------------------------

type ParameterEditHandler = Box<dyn Fn(ParamID, f64) + Send + Sync>;
type RestartHandler = Box<dyn Fn(i32) + Send + Sync>;

/// `IComponentHandler` (+2, + unit handler) dispatching into host closures.
#[derive(Default)]
pub struct ComponentHandlerImpl {
    parameter_edit_handler: Mutex<Option<ParameterEditHandler>>,
    restart_handler: Mutex<Option<RestartHandler>>,
}

impl ComponentHandlerImpl {
    pub fn set_parameter_edit_handler(&self, handler: ParameterEditHandler) {
        *self.parameter_edit_handler.lock().unwrap() = Some(handler);
    }

    pub fn set_restart_handler(&self, handler: RestartHandler) {
        *self.restart_handler.lock().unwrap() = Some(handler);
    }

    /// Detach the closures so callbacks arriving during teardown become
    /// no-ops.
    pub fn disarm(&self) {
        *self.parameter_edit_handler.lock().unwrap() = None;
        *self.restart_handler.lock().unwrap() = None;
    }
}

impl Class for ComponentHandlerImpl {
    type Interfaces = (
        vst3::Steinberg::Vst::IComponentHandler,
        vst3::Steinberg::Vst::IComponentHandler2,
        vst3::Steinberg::Vst::IUnitHandler,
    );
}

impl IComponentHandlerTrait for ComponentHandlerImpl {
    unsafe fn beginEdit(&self, _id: ParamID) -> tresult {
        kResultOk
    }

    unsafe fn performEdit(&self, id: ParamID, valueNormalized: ParamValue) -> tresult {
        if let Some(handler) = self.parameter_edit_handler.lock().unwrap().as_ref() {
            handler(id, valueNormalized);
        }
        kResultOk
    }

    unsafe fn endEdit(&self, _id: ParamID) -> tresult {
        kResultOk
    }

    unsafe fn restartComponent(&self, flags: i32) -> tresult {
        if flags == 0 {
            return kResultOk;
        }
        log::info!("restartComponent invoked with flags {flags:#x}");
        if let Some(handler) = self.restart_handler.lock().unwrap().as_ref() {
            handler(flags);
        }
        kResultOk
    }
}

impl IComponentHandler2Trait for ComponentHandlerImpl {
    unsafe fn setDirty(&self, _state: TBool) -> tresult {
        kResultOk
    }

    unsafe fn requestOpenEditor(&self, _name: FIDString) -> tresult {
        log::warn!("requestOpenEditor invoked (not supported by this host)");
        kResultOk
    }

    unsafe fn startGroupEdit(&self) -> tresult {
        kResultOk
    }

    unsafe fn finishGroupEdit(&self) -> tresult {
        kResultOk
    }
}

impl IUnitHandlerTrait for ComponentHandlerImpl {
    unsafe fn notifyUnitSelection(&self, _unitId: vst3::Steinberg::Vst::UnitID) -> tresult {
        kResultOk
    }

    unsafe fn notifyProgramListChange(
        &self,
        _listId: vst3::Steinberg::Vst::ProgramListID,
        _programIndex: i32,
    ) -> tresult {
        kResultOk
    }
}

// ---------------------------------------------------------------------------
// Attribute list and message (for connection-point traffic)
// ---------------------------------------------------------------------------

enum AttrValue {
    Int(i64),
    Float(f64),
    String(Vec<TChar>),
    Binary(Vec<u8>),
}

fn attr_key(id: FIDString) -> Option<String> {
    if id.is_null() {
        return None;
    }
    unsafe { Some(CStr::from_ptr(id).to_string_lossy().into_owned()) }
}

/// `IAttributeList` over a keyed map; binary and string getters hand out
/// pointers into the stored values, which stay valid until the attribute is
/// overwritten.
#[derive(Default)]
pub struct AttributeListImpl {
    values: Mutex<HashMap<String, AttrValue>>,
}

unsafe impl Send for AttributeListImpl {}
unsafe impl Sync for AttributeListImpl {}

impl Class for AttributeListImpl {
    type Interfaces = (IAttributeList,);
}

impl IAttributeListTrait for AttributeListImpl {
    unsafe fn setInt(&self, id: FIDString, value: i64) -> tresult {
        let Some(key) = attr_key(id) else {
            return kInvalidArgument;
        };
        self.values.lock().unwrap().insert(key, AttrValue::Int(value));
        kResultOk
    }

    unsafe fn getInt(&self, id: FIDString, value: *mut i64) -> tresult {
        let Some(key) = attr_key(id) else {
            return kInvalidArgument;
        };
        if value.is_null() {
            return kInvalidArgument;
        }
        match self.values.lock().unwrap().get(&key) {
            Some(AttrValue::Int(stored)) => {
                *value = *stored;
                kResultOk
            }
            _ => kResultFalse,
        }
    }

    unsafe fn setFloat(&self, id: FIDString, value: f64) -> tresult {
        let Some(key) = attr_key(id) else {
            return kInvalidArgument;
        };
        self.values
            .lock()
            .unwrap()
            .insert(key, AttrValue::Float(value));
        kResultOk
    }

    unsafe fn getFloat(&self, id: FIDString, value: *mut f64) -> tresult {
        let Some(key) = attr_key(id) else {
            return kInvalidArgument;
        };
        if value.is_null() {
            return kInvalidArgument;
        }
        match self.values.lock().unwrap().get(&key) {
            Some(AttrValue::Float(stored)) => {
                *value = *stored;
                kResultOk
            }
            _ => kResultFalse,
        }
    }

    unsafe fn setString(&self, id: FIDString, string: *const TChar) -> tresult {
        let Some(key) = attr_key(id) else {
            return kInvalidArgument;
        };
        if string.is_null() {
            return kInvalidArgument;
        }
        let mut copied = Vec::new();
        let mut cursor = string;
        while *cursor != 0 {
            copied.push(*cursor);
            cursor = cursor.add(1);
        }
        copied.push(0);
        self.values
            .lock()
            .unwrap()
            .insert(key, AttrValue::String(copied));
        kResultOk
    }

    unsafe fn getString(&self, id: FIDString, string: *mut TChar, sizeInBytes: u32) -> tresult {
        let Some(key) = attr_key(id) else {
            return kInvalidArgument;
        };
        if string.is_null() {
            return kInvalidArgument;
        }
        match self.values.lock().unwrap().get(&key) {
            Some(AttrValue::String(stored)) => {
                let capacity = sizeInBytes as usize / std::mem::size_of::<TChar>();
                let length = stored.len().min(capacity);
                std::ptr::copy_nonoverlapping(stored.as_ptr(), string, length);
                kResultOk
            }
            _ => kResultFalse,
        }
    }

    unsafe fn setBinary(&self, id: FIDString, data: *const c_void, sizeInBytes: u32) -> tresult {
        let Some(key) = attr_key(id) else {
            return kInvalidArgument;
        };
        if data.is_null() && sizeInBytes > 0 {
            return kInvalidArgument;
        }
        let bytes = if sizeInBytes == 0 {
            Vec::new()
        } else {
            std::slice::from_raw_parts(data as *const u8, sizeInBytes as usize).to_vec()
        };
        self.values
            .lock()
            .unwrap()
            .insert(key, AttrValue::Binary(bytes));
        kResultOk
    }

    unsafe fn getBinary(
        &self,
        id: FIDString,
        data: *mut *const c_void,
        sizeInBytes: *mut u32,
    ) -> tresult {
        let Some(key) = attr_key(id) else {
            return kInvalidArgument;
        };
        if data.is_null() || sizeInBytes.is_null() {
            return kInvalidArgument;
        }
        match self.values.lock().unwrap().get(&key) {
            Some(AttrValue::Binary(stored)) => {
                *data = stored.as_ptr() as *const c_void;
                *sizeInBytes = stored.len() as u32;
                kResultOk
            }
            _ => kResultFalse,
        }
    }
}

/// `IMessage` created on demand by the host application for connection
/// points.
pub struct MessageImpl {
    message_id: Mutex<CString>,
    attributes_raw: *mut IAttributeList,
}

unsafe impl Send for MessageImpl {}
unsafe impl Sync for MessageImpl {}

impl Default for MessageImpl {
    fn default() -> Self {
        let attributes_raw = ComWrapper::new(AttributeListImpl::default())
            .to_com_ptr::<IAttributeList>()
            .map(|ptr| ptr.into_raw())
            .unwrap_or(std::ptr::null_mut());
        Self {
            message_id: Mutex::new(CString::default()),
            attributes_raw,
        }
    }
}

impl Drop for MessageImpl {
    fn drop(&mut self) {
        if !self.attributes_raw.is_null() {
            unsafe {
                drop(vst3::ComPtr::from_raw(self.attributes_raw));
            }
        }
    }
}

impl Class for MessageImpl {
    type Interfaces = (IMessage,);
}

impl IMessageTrait for MessageImpl {
    unsafe fn getMessageID(&self) -> FIDString {
        self.message_id.lock().unwrap().as_ptr()
    }

    unsafe fn setMessageID(&self, id: FIDString) {
        if id.is_null() {
            return;
        }
        *self.message_id.lock().unwrap() = CStr::from_ptr(id).to_owned();
    }

    unsafe fn getAttributes(&self) -> *mut IAttributeList {
        self.attributes_raw
    }
}

// ---------------------------------------------------------------------------
// Host application
// ---------------------------------------------------------------------------

/// `IHostApplication` exposed as the component/controller context. Creates
/// `IMessage`/`IAttributeList` objects for connection-point traffic.
#[derive(Default)]
pub struct HostApplicationImpl;

impl Class for HostApplicationImpl {
    type Interfaces = (vst3::Steinberg::Vst::IHostApplication,);
}

impl IHostApplicationTrait for HostApplicationImpl {
    unsafe fn getName(&self, name: *mut String128) -> tresult {
        if name.is_null() {
            return kInvalidArgument;
        }
        copy_wstring("uniplug", &mut *name);
        kResultOk
    }

    unsafe fn createInstance(&self, cid: *mut TUID, _iid: *mut TUID, obj: *mut *mut c_void) -> tresult {
        if obj.is_null() {
            return kInvalidArgument;
        }
        if same_guid(
            cid as *const c_void,
            IMessage::IID.as_ptr() as *const c_void,
        ) {
            let raw = ComWrapper::new(MessageImpl::default())
                .to_com_ptr::<IMessage>()
                .map(|ptr| ptr.into_raw())
                .unwrap_or(std::ptr::null_mut());
            *obj = raw as *mut c_void;
            return if raw.is_null() { kNoInterface } else { kResultOk };
        }
        if same_guid(
            cid as *const c_void,
            IAttributeList::IID.as_ptr() as *const c_void,
        ) {
            let raw = ComWrapper::new(AttributeListImpl::default())
                .to_com_ptr::<IAttributeList>()
                .map(|ptr| ptr.into_raw())
                .unwrap_or(std::ptr::null_mut());
            *obj = raw as *mut c_void;
            return if raw.is_null() { kNoInterface } else { kResultOk };
        }
        *obj = std::ptr::null_mut();
        kNoInterface
    }
}

// ---------------------------------------------------------------------------
// IBStream over a byte vector
// ---------------------------------------------------------------------------

/// Growable in-memory `IBStream` used for component/controller state.
#[derive(Default)]
pub struct VectorStream {
    data: Mutex<Vec<u8>>,
    position: Mutex<usize>,
}

impl VectorStream {
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
            position: Mutex::new(0),
        }
    }

    pub fn take_data(&self) -> Vec<u8> {
        std::mem::take(&mut *self.data.lock().unwrap())
    }
}

impl Class for VectorStream {
    type Interfaces = (vst3::Steinberg::IBStream,);
}

impl IBStreamTrait for VectorStream {
    unsafe fn read(&self, buffer: *mut c_void, numBytes: i32, numBytesRead: *mut i32) -> tresult {
        if buffer.is_null() || numBytes < 0 {
            return kInvalidArgument;
        }
        let data = self.data.lock().unwrap();
        let mut position = self.position.lock().unwrap();
        let available = data.len().saturating_sub(*position);
        let to_read = available.min(numBytes as usize);
        std::ptr::copy_nonoverlapping(
            data.as_ptr().add(*position),
            buffer as *mut u8,
            to_read,
        );
        *position += to_read;
        if !numBytesRead.is_null() {
            *numBytesRead = to_read as i32;
        }
        kResultOk
    }

    unsafe fn write(
        &self,
        buffer: *mut c_void,
        numBytes: i32,
        numBytesWritten: *mut i32,
    ) -> tresult {
        if buffer.is_null() || numBytes < 0 {
            return kInvalidArgument;
        }
        let mut data = self.data.lock().unwrap();
        let mut position = self.position.lock().unwrap();
        let bytes = std::slice::from_raw_parts(buffer as *const u8, numBytes as usize);
        if *position + bytes.len() > data.len() {
            data.resize(*position + bytes.len(), 0);
        }
        data[*position..*position + bytes.len()].copy_from_slice(bytes);
        *position += bytes.len();
        if !numBytesWritten.is_null() {
            *numBytesWritten = numBytes;
        }
        kResultOk
    }

    unsafe fn seek(&self, pos: i64, mode: i32, result: *mut i64) -> tresult {
        let data_len = self.data.lock().unwrap().len() as i64;
        let mut position = self.position.lock().unwrap();
        let base = match mode {
            0 => 0,
            1 => *position as i64,
            2 => data_len,
            _ => return kInvalidArgument,
        };
        let target = (base + pos).clamp(0, data_len);
        *position = target as usize;
        if !result.is_null() {
            *result = target;
        }
        kResultOk
    }

    unsafe fn tell(&self, pos: *mut i64) -> tresult {
        if pos.is_null() {
            return kInvalidArgument;
        }
        *pos = *self.position.lock().unwrap() as i64;
        kResultOk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wstring_round_trip() {
        let mut buffer: String128 = [0; 128];
        copy_wstring("Cutoff Frequency", &mut buffer);
        assert_eq!(wstring_to_string(&buffer), "Cutoff Frequency");
    }

    #[test]
    fn test_parameter_changes_points() {
        let changes = ParameterChangesImpl::default();
        changes.add_point(7, 0, 0.25);
        changes.add_point(7, 16, 0.5);
        changes.add_point(9, 0, 1.0);
        let last = changes.last_points();
        assert_eq!(last.len(), 2);
        assert!(last.contains(&(7, 0.5)));
        assert!(last.contains(&(9, 1.0)));
        changes.clear();
        assert!(changes.last_points().is_empty());
    }

    #[test]
    fn test_vector_stream_write_read() {
        let stream = VectorStream::default();
        unsafe {
            let payload = [1u8, 2, 3, 4];
            let mut written = 0;
            assert_eq!(
                stream.write(payload.as_ptr() as *mut c_void, 4, &mut written),
                kResultOk
            );
            assert_eq!(written, 4);
            assert_eq!(stream.seek(0, 0, std::ptr::null_mut()), kResultOk);
            let mut out = [0u8; 8];
            let mut read = 0;
            assert_eq!(
                stream.read(out.as_mut_ptr() as *mut c_void, 8, &mut read),
                kResultOk
            );
            assert_eq!(read, 4);
            assert_eq!(&out[..4], &payload);
        }
    }
}
