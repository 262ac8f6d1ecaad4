/// Declare a boxed TL constructor: a struct with public fields, its
/// constructor id, and both directions of the codec.
///
/// Fields are written in declaration order after the id. Flags are not
/// supported; constructors that need them are written by hand.
macro_rules! tl_object {
    (
        $(#[$meta:meta])*
        $name:ident = $id:literal {
            $( $(#[$fmeta:meta])* $field:ident : $ty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq)]
        pub struct $name {
            $( $(#[$fmeta])* pub $field: $ty, )*
        }

        impl $crate::Identifiable for $name {
            const CONSTRUCTOR_ID: u32 = $id;
        }

        impl $crate::Serializable for $name {
            #[allow(unused_variables)]
            fn serialize(&self, buf: &mut impl Extend<u8>) {
                <Self as $crate::Identifiable>::CONSTRUCTOR_ID.serialize(buf);
                $( self.$field.serialize(buf); )*
            }
        }

        impl $crate::Deserializable for $name {
            fn deserialize(buf: $crate::deserialize::Buffer) -> $crate::deserialize::Result<Self> {
                let id = u32::deserialize(buf)?;
                if id != <Self as $crate::Identifiable>::CONSTRUCTOR_ID {
                    return Err($crate::deserialize::Error::UnexpectedConstructor { id });
                }
                Self::deserialize_bare(buf)
            }
        }

        impl $name {
            /// Read the fields that follow an already consumed constructor id.
            #[allow(unused_variables)]
            pub fn deserialize_bare(buf: $crate::deserialize::Buffer) -> $crate::deserialize::Result<Self> {
                Ok(Self { $( $field: <$ty as $crate::Deserializable>::deserialize(buf)?, )* })
            }
        }
    };
}

/// Declare a boxed TL type with several constructors as an enum over the
/// constructor structs.
macro_rules! tl_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $( $variant:ident($ty:ident) ),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq)]
        pub enum $name {
            $( $variant($ty), )+
        }

        impl $crate::Serializable for $name {
            fn serialize(&self, buf: &mut impl Extend<u8>) {
                match self {
                    $( Self::$variant(x) => x.serialize(buf), )+
                }
            }
        }

        impl $crate::Deserializable for $name {
            fn deserialize(buf: $crate::deserialize::Buffer) -> $crate::deserialize::Result<Self> {
                let id = u32::deserialize(buf)?;
                $(
                    if id == <$ty as $crate::Identifiable>::CONSTRUCTOR_ID {
                        return Ok(Self::$variant($ty::deserialize_bare(buf)?));
                    }
                )+
                Err($crate::deserialize::Error::UnexpectedConstructor { id })
            }
        }
    };
}
