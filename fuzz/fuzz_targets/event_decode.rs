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

#![no_main]

use libfuzzer_sys::fuzz_target;
use mhi_common::{Event, Ring, Tre};

// Any 16 bytes the device leaves on an event ring must decode or be rejected
// without panicking, and whatever decodes must survive a re-encode.
fuzz_target!(|data: (Tre, u64)| {
    let (tre, addr) = data;
    if let Ok(event) = Event::decode(&tre) {
        assert_eq!(Event::decode(&event.encode()), Ok(event));
    }

    let ring = Ring::new(0x1000_0000, 64, 0);
    if let Ok(offset) = ring.to_local_offset(addr) {
        assert!(offset < ring.len_bytes());
        assert_eq!(offset % Tre::SIZE, 0);
        assert_eq!(ring.to_device_address(offset), addr);
    }
});
