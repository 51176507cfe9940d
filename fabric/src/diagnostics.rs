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

use crate::error::{Error, ErrorKind};
use crate::{NodeId, Tick, Word};
use std::cell::RefCell;
use std::rc::Rc;

/// A word the mesh dropped instead of delivering.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DropReport {
    pub step: Tick,
    /// Node that dropped the word; `None` for host-side and egress drops.
    pub at: Option<NodeId>,
    pub error: Error,
    pub word: Word,
}

/// Receives RoutingError and ProtocolError drops for external logging.
pub trait DiagnosticSink {
    fn report(&mut self, report: DropReport);
}

/// Collects drops in memory. Clones share the same log, so a caller can
/// keep one handle and give the other to the mesh.
#[derive(Clone, Debug, Default)]
pub struct DropLog {
    reports: Rc<RefCell<Vec<DropReport>>>,
}

impl DropLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.reports.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.borrow().is_empty()
    }

    pub fn reports(&self) -> Vec<DropReport> {
        self.reports.borrow().clone()
    }

    pub fn kinds(&self) -> Vec<ErrorKind> {
        self.reports.borrow().iter().map(|r| r.error.kind()).collect()
    }
}

impl DiagnosticSink for DropLog {
    fn report(&mut self, report: DropReport) {
        self.reports.borrow_mut().push(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use bitvec::prelude::*;

    #[test]
    fn clones_share_the_log() {
        let log = DropLog::new();
        let mut sink: Box<dyn DiagnosticSink> = Box::new(log.clone());
        sink.report(DropReport {
            step: 3,
            at: Some(NodeId::new(1, 2)),
            error: ProtocolError::UnknownCommand(6).into(),
            word: bitvec![usize, Lsb0; 0; 8].into_boxed_bitslice(),
        });
        assert_eq!(log.len(), 1);
        assert_eq!(log.kinds(), vec![ErrorKind::Protocol]);
        assert_eq!(log.reports()[0].step, 3);
    }
}
