#![no_main]

use hevc_dpb::codec::h265::nalu::NaluType;
use hevc_dpb::codec::h265::picture::PictureHeader;
use hevc_dpb::codec::h265::rps::RpsSyntax;
use hevc_dpb::codec::h265::rps::ShortTermRefPicSet;
use hevc_dpb::codec::h265::sequence::SequenceParams;
use hevc_dpb::decoder::h265::DpbManager;
use hevc_dpb::Resolution;
use libfuzzer_sys::fuzz_target;

fn sequence(data: &[u8]) -> SequenceParams {
    let buffering = data[0] % 16;

    SequenceParams {
        resolution: Resolution {
            width: 64,
            height: 64,
        },
        max_sub_layers_minus1: 0,
        max_dec_pic_buffering_minus1: [buffering, 0, 0, 0, 0, 0, 0],
        max_num_reorder_pics: [data[1] % (buffering + 1), 0, 0, 0, 0, 0, 0],
        max_latency_increase_plus1: [u32::from(data[2] % 4), 0, 0, 0, 0, 0, 0],
        log2_max_pic_order_cnt_lsb_minus4: data[3] % 5,
    }
}

/// Builds a short term RPS from the bits of `mask`: each set bit `i` refers
/// to the picture `i + 1` POCs before the current one.
fn rps(mask: u8) -> RpsSyntax {
    let delta_poc_s0: Vec<i32> = (0..8)
        .filter(|i| mask & (1 << *i) != 0)
        .map(|i| -(i + 1))
        .collect();

    RpsSyntax {
        short_term: ShortTermRefPicSet {
            used_by_curr_pic_s0: vec![true; delta_poc_s0.len()],
            delta_poc_s0,
            ..Default::default()
        },
        long_term: vec![],
    }
}

fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }

    let params = sequence(data);
    let max_pic_order_cnt_lsb = params.max_pic_order_cnt_lsb() as u32;

    let mut manager = DpbManager::<()>::default();
    if manager.new_sequence(params).is_err() {
        return;
    }

    for (frame_num, op) in data[4..].chunks_exact(4).enumerate() {
        match op[0] % 8 {
            0 => manager.end_of_sequence(),
            1 => manager.drain(),
            2 => manager.end_of_bitstream(),
            _ => {
                let hdr = PictureHeader {
                    nalu_type: NaluType::n(op[1] % 22).unwrap_or_default(),
                    nuh_temporal_id: 0,
                    pic_order_cnt_lsb: u32::from(op[2]) % max_pic_order_cnt_lsb,
                    pic_output_flag: op[0] & 0x10 == 0,
                    no_output_of_prior_pics_flag: op[0] & 0x20 != 0,
                };

                let pic = match manager.new_picture(&hdr, 0, frame_num as u32) {
                    Ok(Some(pic)) => pic,
                    Ok(None) => continue,
                    Err(_) => return,
                };

                if manager.begin_picture(&pic, &rps(op[3])).is_err() {
                    return;
                }
                if manager.finish_picture(pic).is_err() {
                    return;
                }
            }
        }

        assert_eq!(
            manager.dpb().num_needed_for_output(),
            manager.dpb().pictures().filter(|p| p.needed_for_output()).count()
        );

        while manager.next_output().is_some() {}
    }
});
