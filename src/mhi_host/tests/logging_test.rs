/*
Copyright 2026  The MHI Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use log::Level;
use mhi_common::{CompletionCode, Event};
use mhi_testing::simplelogger::{LOGGER, SimpleLogger};

pub mod common;
use common::{DATA_ER, UL, loopback_config, powered, wait_for};

#[test]
fn device_misbehaviour_is_logged() {
    SimpleLogger::initialize_test_logger();
    let sim = powered(loopback_config(8));
    let (_dev, _rec) = sim.open("LOOPBACK");

    sim.dev
        .post_event(
            DATA_ER,
            Event::Transfer {
                chan: UL as u8,
                ptr: 0,
                len: 0,
                code: CompletionCode::BadTre,
            },
        )
        .unwrap();
    assert!(wait_for(|| LOGGER.contains(Level::Error, "BadTre")));

    // an event for a channel nobody configured
    sim.dev
        .post_event(
            DATA_ER,
            Event::Transfer {
                chan: 42,
                ptr: 0,
                len: 0,
                code: CompletionCode::Eot,
            },
        )
        .unwrap();
    assert!(wait_for(|| LOGGER.contains(Level::Warn, "unknown channel 42")));

    LOGGER.test_log_records(|calls| {
        let bad = calls
            .iter()
            .find(|c| c.level == Level::Error && c.args.contains("BadTre"))
            .unwrap();
        assert!(bad.target.starts_with("mhi_host::event"));
        assert!(bad.line.is_some());
    });
}
