//! Drop filters for `LoopbackTransport::set_drop_filter`.

use shuttle_core::{Ack, Opcode, Parcel};

/// Lose the first transmission of slice `index` only.
pub fn drop_slice_once(index: u32) -> impl FnMut(&Parcel) -> bool + Send + 'static {
    drop_slice_times(index, 1)
}

/// Lose the first `times` transmissions of slice `index`.
pub fn drop_slice_times(index: u32, times: usize) -> impl FnMut(&Parcel) -> bool + Send + 'static {
    let mut left = times;
    move |parcel| {
        let hit = left > 0 && parcel.slice.is_some_and(|s| s.index == index);
        if hit {
            left -= 1;
        }
        hit
    }
}

/// Lose the first slice-ack for slice `index` only.
pub fn drop_slice_ack_once(index: u32) -> impl FnMut(&Parcel) -> bool + Send + 'static {
    let mut armed = true;
    move |parcel| {
        if !armed {
            return false;
        }
        let hit = matches!(
            Ack::from_parcel(parcel),
            Some(Ok(Ack::Slice(ack))) if ack.slice_index == index
        );
        if hit {
            armed = false;
        }
        hit
    }
}

/// Combine filters: a frame is lost if any of them says so.
pub fn any_of(
    mut a: impl FnMut(&Parcel) -> bool + Send + 'static,
    mut b: impl FnMut(&Parcel) -> bool + Send + 'static,
) -> impl FnMut(&Parcel) -> bool + Send + 'static {
    move |parcel| {
        let lost_a = a(parcel);
        let lost_b = b(parcel);
        lost_a || lost_b
    }
}

/// Lose every frame with this opcode.
pub fn drop_opcode(opcode: Opcode) -> impl FnMut(&Parcel) -> bool + Send + 'static {
    move |parcel| parcel.opcode == opcode
}

/// Lose every `n`th frame.
pub fn drop_every_nth(n: usize) -> impl FnMut(&Parcel) -> bool + Send + 'static {
    let mut seen = 0usize;
    move |_| {
        seen += 1;
        seen % n == 0
    }
}

pub fn black_hole() -> impl FnMut(&Parcel) -> bool + Send + 'static {
    |_| true
}
