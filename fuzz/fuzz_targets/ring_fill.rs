#![no_main]

use std::io::Cursor;

use libfuzzer_sys::fuzz_target;
use mxc_codecs::backend::dummy::progressive_info;
use mxc_codecs::backend::dummy::SimulatedVpu;
use mxc_codecs::backend::OpenParams;
use mxc_codecs::backend::VpuBackend;
use mxc_codecs::codec::StreamFormat;
use mxc_codecs::decoder::ring::BitstreamRing;
use mxc_codecs::memory::heap::HeapAllocator;
use mxc_codecs::memory::DmaAllocator;

const RING_SIZE: usize = 0x2000;

// Every pair of input bytes is one operation: the low bit of the first byte selects between a
// fill and a consume, the rest sizes it. The payload of the fills is the input itself.
fuzz_target!(|data: &[u8]| {
    let allocator = HeapAllocator::default();
    let mut ring = BitstreamRing::new(allocator.allocate(RING_SIZE).unwrap());
    let mut vpu = SimulatedVpu::new(allocator.bus().clone(), progressive_info(64, 48, 2));
    vpu.open(&OpenParams {
        format: StreamFormat::Mpeg2,
        bitstream_phys: ring.phys_addr(),
        bitstream_size: ring.size(),
        reorder: true,
        deblocking: false,
        chroma_interleave: false,
        map_type: Default::default(),
        tiled_to_linear: false,
        bitstream_mode: Default::default(),
        jpeg_line_buffer: false,
        ps_save_buffer: None,
    })
    .unwrap();

    let mut source = Cursor::new(data.repeat(8));
    for op in data.chunks_exact(2) {
        let amount = (usize::from(op[0] >> 1) << 8 | usize::from(op[1])) % (2 * RING_SIZE);
        if op[0] & 1 == 0 {
            // A failure here means the ring was overrun.
            ring.fill(&mut vpu, &mut source, amount).unwrap();
        } else {
            vpu.consume_bitstream(amount);
        }

        let pointers = vpu.bitstream_pointers().unwrap();
        assert!(pointers.space <= RING_SIZE);
        assert!(pointers.write >= ring.phys_addr());
        assert!(pointers.write < ring.phys_addr() + RING_SIZE as u64);
    }
});
