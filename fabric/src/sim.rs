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

use crate::vcd::VcdWriter;
use std::cell::RefCell;
use std::rc::Rc;

/// Optional observers invoked while the mesh steps.
#[derive(Default)]
pub struct SimulationCallbacks {
    vcd_writer: Option<Rc<RefCell<VcdWriter>>>,
}

impl SimulationCallbacks {
    pub fn get_vcd_writer(&self) -> Option<Rc<RefCell<VcdWriter>>> {
        self.vcd_writer.as_ref().map(Rc::clone)
    }

    pub fn create_vcd_callbacks(writer: VcdWriter) -> Self {
        Self {
            vcd_writer: Some(Rc::new(RefCell::new(writer))),
        }
    }

    pub fn vcd<F>(&mut self, f: F)
    where
        F: FnOnce(Rc<RefCell<VcdWriter>>),
    {
        if let Some(writer) = self.get_vcd_writer() {
            f(writer)
        }
    }
}
