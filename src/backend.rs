use burn::backend::Autodiff;

#[cfg(feature = "cuda")]
pub type MyBackend = burn::backend::Cuda<f32, i32>;

#[cfg(all(feature = "wgpu", not(feature = "cuda")))]
pub type MyBackend = burn::backend::Wgpu;

#[cfg(not(any(feature = "wgpu", feature = "cuda")))]
pub type MyBackend = burn::backend::NdArray;

pub type MyAutodiffBackend = Autodiff<MyBackend>;

pub fn device() -> <MyBackend as burn::prelude::Backend>::Device {
    Default::default()
}
