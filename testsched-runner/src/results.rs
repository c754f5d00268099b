// Copyright (c) The testsched Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reading the XML results that QTestLib-style tests write through `-o <file>,xml`.
//!
//! Only as much of the format is understood as is needed to find the test functions that failed:
//!
//! ```xml
//! <TestCase name="tst_Foo">
//!   <TestFunction name="parsesInput">
//!     <Incident type="fail" file="tst_foo.cpp" line="42">
//!       <DataTag><![CDATA[empty]]></DataTag>
//!     </Incident>
//!   </TestFunction>
//! </TestCase>
//! ```

use crate::errors::ResultsParseError;
use camino::Utf8Path;
use quick_xml::{
    Reader,
    events::{BytesStart, Event},
};

const TEST_FUNCTION_TAG: &[u8] = b"TestFunction";
const INCIDENT_TAG: &[u8] = b"Incident";

/// Returns the names of the test functions with at least one failing incident, in the order they
/// appear in `xml`.
///
/// A function that failed for several data rows is listed once.
pub fn failing_functions(xml: &str) -> Result<Vec<String>, ResultsParseError> {
    let mut reader = Reader::from_str(xml);
    let mut current: Option<String> = None;
    let mut failing = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(tag) if tag.name().as_ref() == TEST_FUNCTION_TAG => {
                current = attribute(&tag, "name")?;
            }
            Event::End(tag) if tag.name().as_ref() == TEST_FUNCTION_TAG => current = None,
            Event::Start(tag) | Event::Empty(tag) if tag.name().as_ref() == INCIDENT_TAG => {
                if attribute(&tag, "type")?.as_deref() != Some("fail") {
                    continue;
                }
                if let Some(name) = &current {
                    if !failing.contains(name) {
                        failing.push(name.clone());
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(failing)
}

/// Reads the results log at `path` and returns its failing test functions.
pub fn failing_functions_in(path: &Utf8Path) -> Result<Vec<String>, ResultsParseError> {
    let xml = std::fs::read_to_string(path).map_err(|err| ResultsParseError::Read {
        path: path.to_owned(),
        err,
    })?;
    failing_functions(&xml)
}

fn attribute(tag: &BytesStart<'_>, name: &str) -> Result<Option<String>, quick_xml::Error> {
    match tag.try_get_attribute(name)? {
        Some(attr) => Ok(Some(attr.unescape_value()?.into_owned())),
        None => Ok(None),
    }
}
