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

use crate::codec::Parameter;
use crate::config::MeshConfiguration;

/// Answers CONTROL reads of read-only parameters. `address` is the
/// parameter code from the CONTROL payload.
pub trait ResponseStrategy {
    fn respond(&self, address: u64) -> u64;
}

/// Reports the device parameters a mesh was built with.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceParameters {
    pub identity: u16,
    pub version: u16,
    pub counter_width: usize,
    pub rows: usize,
    pub columns: usize,
    pub inputs: usize,
    pub outputs: usize,
    pub registers: usize,
}

impl DeviceParameters {
    pub fn from_config(config: &MeshConfiguration) -> Self {
        Self {
            identity: config.identity,
            version: config.version,
            counter_width: config.counter_width,
            rows: config.rows,
            columns: config.columns,
            inputs: config.node.inputs,
            outputs: config.node.outputs,
            registers: config.node.registers,
        }
    }
}

impl ResponseStrategy for DeviceParameters {
    fn respond(&self, address: u64) -> u64 {
        match Parameter::from_code(address) {
            Ok(Parameter::Identity) => self.identity as u64,
            Ok(Parameter::Version) => self.version as u64,
            Ok(Parameter::CounterWidth) => self.counter_width as u64,
            Ok(Parameter::Rows) => self.rows as u64,
            Ok(Parameter::Columns) => self.columns as u64,
            Ok(Parameter::NodeInputs) => self.inputs as u64,
            Ok(Parameter::NodeOutputs) => self.outputs as u64,
            Ok(Parameter::NodeRegisters) => self.registers as u64,
            // the node answers reads of its own writable parameters
            _ => 0,
        }
    }
}
