// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bitvec::prelude::*;
use chrono;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Display;
use std::fs;
use std::io;
use std::path::Path;
use std::rc::Rc;
use vcd;

pub const DEFAULT_TOP_MODULE: &str = "fabric";
const DEFAULT_VCD_HEADER: &str = "fabric VCD";

/// Writes value changes of a simulation to a VCD stream.
///
/// I/O errors are logged once and further output is suppressed; tracing
/// never fails the simulation.
pub struct VcdWriter {
    writer: vcd::Writer<Box<dyn io::Write>>,
    is_error_state: bool,
    scope_stack: Vec<String>,
    id_map: HashMap<String, vcd::IdCode>,
    last_value_map: HashMap<vcd::IdCode, BitVec<usize, Lsb0>>,
    timestamp: Option<u64>,
}

pub struct VcdTraceScope {
    writer: Rc<RefCell<VcdWriter>>,
    scope: String,
}

impl Drop for VcdTraceScope {
    fn drop(&mut self) {
        self.writer.borrow_mut().leave_scope(self.scope.as_str());
    }
}

pub struct VcdDeclScope {
    writer: Rc<RefCell<VcdWriter>>,
    scope: String,
}

impl Drop for VcdDeclScope {
    fn drop(&mut self) {
        self.writer.borrow_mut().upscope(self.scope.as_str());
    }
}

impl VcdWriter {
    pub fn new(dst: Box<dyn io::Write>) -> Self {
        Self {
            writer: vcd::Writer::new(dst),
            is_error_state: false,
            scope_stack: vec![],
            id_map: HashMap::new(),
            last_value_map: HashMap::new(),
            timestamp: None,
        }
    }

    pub fn create<P: AsRef<Path>>(dst: P) -> io::Result<Self> {
        let file = fs::File::create(dst.as_ref())?;
        log::debug!("VCD file: {}", dst.as_ref().display());
        Ok(Self::new(Box::new(io::BufWriter::new(file))))
    }

    fn record_failure(&mut self, err: io::Error) {
        if !self.is_error_state {
            self.is_error_state = true;
            log::error!("VCD output disabled after write error: {:?}", err)
        }
    }

    pub fn is_error_state(&self) -> bool {
        self.is_error_state
    }

    pub fn managed_decl_scope<T>(writer: Rc<RefCell<VcdWriter>>, scope: &T) -> VcdDeclScope
    where
        T: Display + ?Sized,
    {
        writer.borrow_mut().add_module(scope);
        VcdDeclScope {
            writer: Rc::clone(&writer),
            scope: scope.to_string(),
        }
    }

    pub fn managed_trace_scope<T>(writer: Rc<RefCell<VcdWriter>>, scope: &T) -> VcdTraceScope
    where
        T: Display + ?Sized,
    {
        writer.borrow_mut().enter_scope(scope);
        VcdTraceScope {
            writer: Rc::clone(&writer),
            scope: scope.to_string(),
        }
    }

    /// Declare the variables of `component` and record their initial values
    /// at time 0.
    pub fn write_header(writer: Rc<RefCell<Self>>, component: &dyn VcdComponent) {
        {
            let mut w = writer.borrow_mut();
            if let Err(err) = w.writer.comment(DEFAULT_VCD_HEADER) {
                w.record_failure(err);
            }
            let date = chrono::Utc::now().to_string();
            if let Err(err) = w.writer.date(date.as_str()) {
                w.record_failure(err);
            }
        }
        {
            let _vcd_decl_scope =
                VcdWriter::managed_decl_scope(Rc::clone(&writer), DEFAULT_TOP_MODULE);
            component.vcd_write_scope(Rc::clone(&writer));
        }
        {
            let mut w = writer.borrow_mut();
            if let Err(err) = w.writer.enddefinitions() {
                w.record_failure(err);
            }
        }
        writer.borrow_mut().set_time(0);
        let _vcd_trace_scope =
            VcdWriter::managed_trace_scope(Rc::clone(&writer), DEFAULT_TOP_MODULE);
        component.vcd_record(Rc::clone(&writer));
    }

    /// Record a component's values at `time`.
    pub fn record(writer: Rc<RefCell<Self>>, time: u64, component: &dyn VcdComponent) {
        writer.borrow_mut().set_time(time);
        let _vcd_trace_scope =
            VcdWriter::managed_trace_scope(Rc::clone(&writer), DEFAULT_TOP_MODULE);
        component.vcd_record(Rc::clone(&writer));
    }

    /// Start a new timestamp; the first change after this emits it.
    pub fn set_time(&mut self, time: u64) {
        self.timestamp = Some(time);
    }

    fn enter_scope<T: Display + ?Sized>(&mut self, name: &T) {
        self.scope_stack.push(name.to_string())
    }

    fn leave_scope<T: Display + ?Sized>(&mut self, scope: &T) {
        let popped_scope = self.scope_stack.pop();
        debug_assert_eq!(popped_scope, Some(scope.to_string()));
    }

    fn add_module<T: Display + ?Sized>(&mut self, name: &T) {
        self.scope_stack.push(name.to_string());
        if self.is_error_state {
            return;
        }
        if let Err(err) = self.writer.add_module(&name.to_string()) {
            self.record_failure(err);
        }
    }

    fn upscope<T: Display + ?Sized>(&mut self, scope: &T) {
        self.leave_scope(scope);
        if self.is_error_state {
            return;
        }
        if let Err(err) = self.writer.upscope() {
            self.record_failure(err);
        }
    }

    pub fn add_wire(&mut self, width: usize, reference: &str) {
        self.add_var(vcd::VarType::Wire, width, reference);
    }

    pub fn add_integer_var(&mut self, reference: &str) {
        self.add_var(vcd::VarType::Integer, 64, reference);
    }

    fn add_var(&mut self, var_type: vcd::VarType, width: usize, reference: &str) {
        if self.is_error_state {
            return;
        }
        match self
            .writer
            .add_var(var_type, width as u32, &reference.to_string(), None)
        {
            Ok(var_id) => self.bind_id(reference, var_id),
            Err(err) => self.record_failure(err),
        }
    }

    fn qualified_name(&self, name: &str) -> String {
        self.scope_stack.join(".") + "." + name
    }

    fn bind_id(&mut self, name: &str, vcd_id: vcd::IdCode) {
        let qualified_name = self.qualified_name(name);
        if self.id_map.contains_key(qualified_name.as_str()) {
            log::warn!("Scoped name {} was redefined for VCD dumps.", qualified_name);
        }
        self.id_map.insert(qualified_name, vcd_id);
    }

    fn find_id(&self, name: &str) -> Option<vcd::IdCode> {
        let qualified_name = self.qualified_name(name);
        let id_code = self.id_map.get(qualified_name.as_str()).copied();
        if id_code.is_none() {
            log::warn!(
                "VCD variable {} was never declared.",
                qualified_name
            );
        }
        id_code
    }

    pub fn change_value(&mut self, name: &str, value: u64, width: usize) {
        let mut bits: BitVec<usize, Lsb0> = BitVec::repeat(false, width);
        let stored = width.min(64);
        if stored > 0 {
            bits[..stored].store_le(value);
        }
        self.change_bits(name, &bits);
    }

    pub fn change_bits(&mut self, name: &str, bits: &BitSlice<usize, Lsb0>) {
        if self.is_error_state {
            return;
        }
        if let Some(id_code) = self.find_id(name) {
            if let Err(err) = self.record_change(id_code, bits) {
                self.record_failure(err);
            }
        }
    }

    fn record_change(
        &mut self,
        id_code: vcd::IdCode,
        bits: &BitSlice<usize, Lsb0>,
    ) -> io::Result<()> {
        if let Some(last) = self.last_value_map.get(&id_code) {
            if last.as_bitslice() == bits {
                return Ok(());
            }
        }
        if let Some(time) = self.timestamp.take() {
            self.writer.timestamp(time)?;
        }
        // VCD vectors are written most significant bit first
        let values = bits
            .iter()
            .rev()
            .map(|b| (*b).into())
            .collect::<Vec<vcd::Value>>();
        self.writer.change_vector(id_code, values.as_slice())?;
        self.last_value_map.insert(id_code, bits.to_bitvec());
        Ok(())
    }
}

/// A component that declares and records traced values. Each component
/// calls the same methods on the components it contains.
pub trait VcdComponent {
    /// Declare this component's variables in the VCD header.
    fn vcd_write_scope(&self, vcd_writer: Rc<RefCell<VcdWriter>>);

    /// Record the current values of the declared variables.
    fn vcd_record(&self, vcd_writer: Rc<RefCell<VcdWriter>>);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// An in-memory sink whose contents stay readable after the writer
    /// takes ownership of a clone.
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuffer(pub Rc<RefCell<Vec<u8>>>);

    impl io::Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        pub(crate) fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.borrow()).into_owned()
        }
    }

    struct Counter {
        value: RefCell<u64>,
    }

    impl VcdComponent for Counter {
        fn vcd_write_scope(&self, writer: Rc<RefCell<VcdWriter>>) {
            let _scope = VcdWriter::managed_decl_scope(Rc::clone(&writer), "counter");
            writer.borrow_mut().add_wire(4, "value");
        }

        fn vcd_record(&self, writer: Rc<RefCell<VcdWriter>>) {
            let _scope = VcdWriter::managed_trace_scope(Rc::clone(&writer), "counter");
            writer
                .borrow_mut()
                .change_value("value", *self.value.borrow(), 4);
        }
    }

    #[test]
    fn records_only_changes() {
        let buffer = SharedBuffer::default();
        let writer = Rc::new(RefCell::new(VcdWriter::new(Box::new(buffer.clone()))));
        let counter = Counter {
            value: RefCell::new(0),
        };
        VcdWriter::write_header(Rc::clone(&writer), &counter);
        *counter.value.borrow_mut() = 5;
        VcdWriter::record(Rc::clone(&writer), 1, &counter);
        // unchanged: no timestamp 2 in the output
        VcdWriter::record(Rc::clone(&writer), 2, &counter);
        *counter.value.borrow_mut() = 6;
        VcdWriter::record(Rc::clone(&writer), 3, &counter);

        let text = buffer.text();
        assert!(text.contains("$scope module fabric $end"));
        assert!(text.contains("$scope module counter $end"));
        assert!(text.contains("#1"));
        assert!(!text.contains("#2"));
        assert!(text.contains("#3"));
        assert!(text.contains("b0101 "));
        assert!(text.contains("b0110 "));
        assert!(!writer.borrow().is_error_state());
    }
}
