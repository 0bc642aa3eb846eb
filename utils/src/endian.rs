use crate::bytes::Cast;

/// An integer type that can be packed into and read out of a fixed-size byte array in a
/// given byteorder.
#[doc(hidden)]
pub trait IntBytes: Copy {
	type Bytes: Copy + Default;

	fn to_be(self) -> Self::Bytes;
	fn from_be(bytes: Self::Bytes) -> Self;
}

macro_rules! define_types {
	( $( $int:ident ($be:ident) )* ) => {
		$(
			impl IntBytes for $int {
				type Bytes = [u8; core::mem::size_of::<$int>()];

				#[inline(always)]
				fn to_be(self) -> Self::Bytes {
					$int::to_be_bytes(self)
				}

				#[inline(always)]
				fn from_be(bytes: Self::Bytes) -> Self {
					$int::from_be_bytes(bytes)
				}
			}

			#[doc = concat!("A `", stringify!($int), "` represented on the wire in big-endian byteorder.")]
			#[derive(Clone, Copy, Default, PartialEq, Eq)]
			#[repr(transparent)]
			#[allow(non_camel_case_types)]
			pub struct $be(<$int as IntBytes>::Bytes);

			impl $be {
				/// Read the value out of its big-endian wire representation.
				#[inline(always)]
				pub fn get(self) -> $int {
					$int::from_be(self.0)
				}
			}

			impl From<$int> for $be {
				#[inline(always)]
				fn from(value: $int) -> Self {
					Self(<$int as IntBytes>::to_be(value))
				}
			}

			impl From<$be> for $int {
				#[inline(always)]
				fn from(value: $be) -> Self {
					value.get()
				}
			}

			impl core::fmt::Debug for $be {
				fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
					core::fmt::Debug::fmt(&self.get(), f)
				}
			}

			unsafe impl Cast for $be {}
		)*
	};
}

define_types!( u16(u16be) u32(u32be) u64(u64be) );
