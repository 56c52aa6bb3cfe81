mod bundler;

pub use bundler::BundlerClient;
